#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::collections::HashMap;

use pmta::{
    engine::memory::Op, Config, Connection, Encoding, ErrorKind, Notify, Recipient, ReturnType,
    Target,
};
use pretty_assertions::assert_eq;

#[test]
fn build_bind_and_lock() {
    let engine = support::engine();
    let mut message = support::message(&engine);
    message.set_envelope_id("X1").unwrap();

    let mut recipient = Recipient::new(&engine, "c@d.com").unwrap();
    recipient.define_variable("name", "Bob").unwrap();

    let mut bound = message.add_recipient(recipient).unwrap();
    let err = bound.define_variable("name", "Alice").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LockedObject);
    assert_eq!(err.message(), "Cannot modify locked object");
    assert_eq!(bound.variable("name"), Some("Bob"));
    assert_eq!(bound.last_error(), Some(err));
    assert_eq!(engine.count(Op::DefineVariable), 1);

    let mut connection = support::connect(&engine);
    connection.submit(&message).unwrap();

    let submission = &engine.submissions()[0];
    assert_eq!(submission.originator, "a@b.com");
    assert_eq!(submission.envelope_id.as_deref(), Some("X1"));
    assert_eq!(
        submission.recipients[0].variables,
        HashMap::from([("name".to_owned(), "Bob".to_owned())])
    );
}

#[test]
fn unreachable_host_never_submits() {
    let engine = support::engine();
    let mut connection = Connection::open(
        &engine,
        &Config::default(),
        &Target::default().server("bad-host"),
    )
    .unwrap();

    assert!(!connection.is_connected());
    let connect_error = connection.connect_error().cloned().unwrap();
    assert_eq!(connect_error.kind(), ErrorKind::Io);
    assert!(!connect_error.message().is_empty());

    let mut message = support::message(&engine);
    message
        .add_recipient(Recipient::new(&engine, "c@d.com").unwrap())
        .unwrap();

    let err = connection.submit(&message).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    assert_eq!(engine.count(Op::Submit), 0);
    assert!(engine.submissions().is_empty());
}

#[test]
fn credential_selection() {
    let cases = [
        (Target::default(), Op::Connect),
        (Target::default().credentials("", ""), Op::Connect),
        (Target::default().credentials("user", "pass"), Op::ConnectAuth),
        (Target::default().username("user"), Op::Connect),
        (Target::default().password("pass"), Op::Connect),
    ];

    for (target, expected) in cases {
        let engine = support::engine();
        let connection = Connection::open(&engine, &Config::default(), &target).unwrap();

        assert!(connection.is_connected(), "{target:?}");
        assert_eq!(engine.count(expected), 1, "{target:?}");
        assert_eq!(
            engine.count(Op::Connect) + engine.count(Op::ConnectAuth),
            1,
            "{target:?}"
        );
    }
}

#[test]
fn configured_credentials_fill_the_gaps() {
    let engine = support::engine();
    let config = Config::from_toml(
        r#"
        [pmta]
        server = "relay.example.com"
        port = 2525
        username = "submitter"
        password = "secret"
        "#,
    )
    .unwrap();

    let connection = Connection::open(&engine, &config, &Target::default()).unwrap();

    assert!(connection.is_authenticated());
    assert_eq!(connection.server(), "relay.example.com");
    assert_eq!(connection.port(), 2525);
    assert_eq!(
        engine.journal()[1].argument.as_deref(),
        Some("submitter@relay.example.com:2525")
    );
}

#[test]
fn body_bytes_are_preserved_in_order() {
    let engine = support::engine();
    let mut message = support::message(&engine);
    message
        .add_recipient(Recipient::new(&engine, "c@d.com").unwrap())
        .unwrap();

    let chunks: [&[u8]; 4] = [
        b"Subject: binary\r\n\r\n",
        b"\x00\x01\x02",
        b"",
        "caf\u{e9}\r\n".as_bytes(),
    ];
    for chunk in chunks {
        message.add_data(chunk).unwrap();
    }
    message.begin_part(1).unwrap();
    message.add_merge_data(b"Hello [name]\0!").unwrap();

    let mut connection = support::connect(&engine);
    connection.submit(&message).unwrap();

    let mut expected = chunks.concat();
    expected.extend_from_slice(b"Hello [name]\0!");

    let submission = &engine.submissions()[0];
    assert_eq!(submission.body, expected);
    assert_eq!(submission.body.len(), message.body_len());
    assert_eq!(submission.parts, vec![1]);
}

#[test]
fn read_after_set() {
    let engine = support::engine();
    let mut message = support::message(&engine);

    message.set_virtual_mta("пул-1").unwrap();
    message.set_job_id("ジョブ").unwrap();
    message.set_envelope_id("env\u{1F4E7}").unwrap();
    message.set_return_type(ReturnType::Full).unwrap();
    message.set_encoding(Encoding::EightBit).unwrap();
    message.set_verp(false).unwrap();

    assert_eq!(message.virtual_mta(), Some("пул-1"));
    assert_eq!(message.job_id(), Some("ジョブ"));
    assert_eq!(message.envelope_id(), Some("env\u{1F4E7}"));
    assert_eq!(message.return_type(), Some(ReturnType::Full));
    assert_eq!(message.encoding(), Some(Encoding::EightBit));
    assert_eq!(message.verp(), Some(false));

    let mut recipient = Recipient::new(&engine, "müller@example.de").unwrap();
    recipient.define_variable("grüße", "¡hola!").unwrap();
    recipient
        .set_notify(Notify::SUCCESS | Notify::FAILURE)
        .unwrap();

    assert_eq!(recipient.variable("grüße"), Some("¡hola!"));
    assert_eq!(recipient.notify(), Notify::SUCCESS | Notify::FAILURE);
}

#[test]
fn setters_after_submission_are_rejected_by_the_engine() {
    let engine = support::engine();
    let mut message = support::message(&engine);
    message
        .add_recipient(Recipient::new(&engine, "c@d.com").unwrap())
        .unwrap();
    message.set_job_id("first").unwrap();

    let mut connection = support::connect(&engine);
    connection.submit(&message).unwrap();

    let err = message.set_job_id("second").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    assert_eq!(message.job_id(), Some("first"));

    let err = connection.submit(&message).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    assert_eq!(engine.submissions().len(), 1);
}
