#![no_main]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use libfuzzer_sys::fuzz_target;
use logreceiver_core::{Host, HostResolver, MAX_PRIORITY};
use logreceiver_storage::encode_row;
use logreceiver_syslog::SyslogParser;

struct FixedResolver;

#[async_trait]
impl HostResolver for FixedResolver {
    async fn get_or_create_host(
        &self,
        address: IpAddr,
        name: Option<&str>,
    ) -> logreceiver_core::Result<Host> {
        Ok(Host::new(1, address, name.map(str::to_string)))
    }
}

fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("failed to build runtime")
    })
}

fuzz_target!(|data: &[u8]| {
    // Arbitrary datagrams must either parse or fail with an error, never panic.
    // Whatever parses must also serialize into a COPY row.
    let mut parser = SyslogParser::new(Arc::new(FixedResolver));
    let sender = IpAddr::V4(Ipv4Addr::LOCALHOST);

    if let Ok(message) = runtime().block_on(parser.parse(sender, data)) {
        assert!(message.priority <= MAX_PRIORITY);
        let _ = encode_row(&message);
    }
});
