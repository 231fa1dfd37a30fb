use std::sync::Arc;
use std::sync::atomic::Ordering;

use ravel::{Config, MemoryStore, Server, init_logging};

fn main() -> ravel::Result<()> {
    init_logging();

    let mut server = Server::new(Config::default(), Arc::new(MemoryStore::new()))?;

    let stop = server.shutdown_handle();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::Release);
    })
    .expect("failed to install ctrl-c handler");

    server.run()
}
