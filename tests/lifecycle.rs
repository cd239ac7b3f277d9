#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::collections::HashMap;

use pmta::{
    engine::memory::{Call, Op},
    Config, Connection, ErrorKind, Message, Notify, Recipient, Target,
};
use pretty_assertions::assert_eq;

/// Every allocated object is freed exactly once, either by its own handle
/// or together with the message it was bound to.
fn assert_released_once(journal: &[Call]) {
    let mut frees: HashMap<u64, usize> = HashMap::new();
    for call in journal {
        if matches!(call.op, Op::SessionFree | Op::MessageFree | Op::RecipientFree) {
            *frees.entry(call.target).or_default() += 1;
        }
    }

    assert!(frees.values().all(|count| *count == 1), "{frees:?}");
}

#[test]
fn everything_is_released() {
    let engine = support::engine();

    {
        let mut connection = support::connect(&engine);
        let mut message = support::message(&engine);

        let mut bound = Recipient::new(&engine, "c@d.com").unwrap();
        bound.set_notify(Notify::ALWAYS).unwrap();
        message.add_recipient(bound).unwrap();

        engine.fail_next(Op::AddRecipient, ErrorKind::Service, "recipient limit");
        let rejected = message
            .add_recipient(Recipient::new(&engine, "e@f.com").unwrap())
            .unwrap_err();
        assert!(!rejected.recipient.is_frozen());

        let _unbound = Recipient::new(&engine, "g@h.com").unwrap();
        let _invalid = Recipient::new(&engine, "invalid").unwrap();

        message.add_data(b"hello").unwrap();
        connection.submit(&message).unwrap();

        assert_eq!(engine.outstanding(), 6);
    }

    assert_eq!(engine.outstanding(), 0);
    assert_released_once(&engine.journal());

    // The bound recipient went away with its message.
    assert_eq!(engine.count(Op::RecipientFree), 3);
    assert_eq!(engine.count(Op::MessageFree), 1);
    assert_eq!(engine.count(Op::SessionFree), 1);
}

#[test]
fn failed_handles_are_released() {
    let engine = support::engine();

    {
        let _connection = Connection::open(
            &engine,
            &Config::default(),
            &Target::default().server("bad-host"),
        )
        .unwrap();
        let message = Message::new(&engine, "not an address").unwrap();
        assert!(!message.is_ready());
    }

    assert_eq!(engine.outstanding(), 0);
    assert_released_once(&engine.journal());
}

#[test]
fn allocation_failures_are_always_errors() {
    let engine = support::engine();

    engine.fail_next(Op::MessageAlloc, ErrorKind::OutOfMemory, "");
    let err = Message::new(&engine, "a@b.com").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LocalBinding);
    assert_eq!(err.code(), 255);

    engine.fail_next(Op::RecipientAlloc, ErrorKind::OutOfMemory, "");
    let err = Recipient::new(&engine, "c@d.com").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LocalBinding);
    assert_eq!(engine.count(Op::RecipientInit), 0);

    assert_eq!(engine.outstanding(), 0);
}

#[test]
fn frozen_recipients_never_reach_the_engine() {
    let engine = support::engine();
    let mut message = support::message(&engine);

    let mut recipient = Recipient::new(&engine, "c@d.com").unwrap();
    recipient.set_notify(Notify::DELAY).unwrap();
    message.add_recipient(recipient).unwrap();

    let calls = engine.journal().len();
    let mut bound = message.recipient_mut(0).unwrap();

    assert!(bound.is_frozen());
    assert_eq!(
        bound.set_notify(Notify::NEVER).unwrap_err().kind(),
        ErrorKind::LockedObject
    );
    assert_eq!(
        bound.define_variable("name", "Bob").unwrap_err().kind(),
        ErrorKind::LockedObject
    );
    assert_eq!(bound.notify(), Notify::DELAY);
    assert!(bound.variables().is_empty());

    assert_eq!(engine.journal().len(), calls);
}

#[test]
fn rejected_recipient_can_be_retried() {
    let engine = support::engine();
    let mut message = support::message(&engine);

    engine.fail_next(Op::AddRecipient, ErrorKind::Service, "try again");
    let mut rejected = message
        .add_recipient(Recipient::new(&engine, "c@d.com").unwrap())
        .unwrap_err();
    assert_eq!(rejected.error.message(), "try again");
    assert_eq!(
        message.last_error().map(|err| err.kind()),
        Some(ErrorKind::Service)
    );

    rejected.recipient.define_variable("attempt", "2").unwrap();
    let bound = message.add_recipient(rejected.recipient).unwrap();
    assert_eq!(bound.variable("attempt"), Some("2"));

    assert_eq!(message.recipients().len(), 1);
    assert_eq!(message.last_error(), None);
}
