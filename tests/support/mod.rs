#![allow(dead_code)]

use std::sync::Arc;

use pmta::{Config, Connection, MemoryEngine, Message, Target};

pub fn engine() -> Arc<MemoryEngine> {
    Arc::new(MemoryEngine::new().with_unreachable_host("bad-host"))
}

pub fn connect(engine: &Arc<MemoryEngine>) -> Connection<MemoryEngine> {
    Connection::open(
        engine,
        &Config::default(),
        &Target::default().server("mta.example.com"),
    )
    .expect("session allocation")
}

pub fn message(engine: &Arc<MemoryEngine>) -> Message<MemoryEngine> {
    Message::new(engine, "a@b.com").expect("message allocation")
}
