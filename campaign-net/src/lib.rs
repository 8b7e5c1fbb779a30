//! This library provides the message-passing transport for `campaign`
//! runs.
//!
//! Workers running in separate processes, or on other machines, exchange
//! their run's data with the runner over TCP instead of a shared
//! directory. The runner side binds a listener and publishes its address
//! to workers through the environment, the worker side connects, fetches
//! its input and publishes output and elapsed time on completion.
//!
//! Messages are framed with a length prefix and encoded with `bincode`,
//! see [`msg`] for the definitions.
//!
//! The transport is made available under the `tcp` class by registering
//! it with the plugin registry at startup:
//!
//! ```ignore
//! let mut plugins = campaign_core::Plugins::default();
//! campaign_net::register(&mut plugins);
//! ```
//!
//! [`msg`]: msg/index.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod msg;
pub mod tcp;

mod error;

pub use error::{Error, Result};
pub use tcp::{TcpInterface, TcpRunnerInterface};

use campaign_core::plugins::TransportPlugin;
use campaign_core::Plugins;

/// Registers the `tcp` transport.
pub fn register(plugins: &mut Plugins) {
    plugins.register_interface(
        tcp::LABEL,
        TransportPlugin {
            runner: |config, registry| {
                Ok(Box::new(TcpRunnerInterface::from_config(
                    &config.run.interface,
                    registry,
                )?))
            },
            worker: Some(|config, run_id| {
                Ok(Box::new(TcpInterface::from_worker_config(config, run_id)?))
            }),
        },
    );
}

#[test]
fn tcp_class_resolves_once_registered() {
    use campaign_core::config::Config;

    let mut config = Config::from_str_toml("[run]\ninterface = \"tcp\"").unwrap();
    config.base_dir = Some(std::path::PathBuf::from("/tmp"));
    assert!(config.clone().resolve(&Plugins::default()).is_err());

    let mut plugins = Plugins::default();
    register(&mut plugins);
    let resolved = config.resolve(&plugins).unwrap();
    assert_eq!(resolved.run.interface.class(), "tcp");
}

#[test]
fn zero_read_timeout_is_rejected() {
    use campaign_core::config::Config;

    let mut plugins = Plugins::default();
    register(&mut plugins);
    let mut config =
        Config::from_str_toml("[run.interface]\nclass = \"tcp\"\ntimeout = 0").unwrap();
    config.base_dir = Some(std::path::PathBuf::from("/tmp"));
    match config.resolve(&plugins) {
        Err(campaign_core::Error::InvalidConfiguration(msg)) => assert!(msg.contains("timeout")),
        other => panic!("unexpected: {:?}", other),
    }
}
