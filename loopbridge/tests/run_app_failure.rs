//! A failing setup stops the loop and surfaces its error from `run_app`.

use std::sync::Arc;

use anyhow::bail;
use loopbridge::{App, AppContext, BridgeConfig, BridgeError, EventLoop, HeadlessRuntime};

struct Broken;

impl App for Broken {
    async fn setup(self, _cx: AppContext) -> anyhow::Result<()> {
        bail!("no window available")
    }
}

#[test]
fn failing_setup_is_reported() {
    assert!(matches!(loopbridge::spawn(async {}), Err(BridgeError::NotInstalled)));

    let err = loopbridge::run_app(Broken, Arc::new(HeadlessRuntime::new()), BridgeConfig::default())
        .unwrap_err();
    assert_eq!(err.to_string(), "no window available");

    let again = loopbridge::run_app(Broken, Arc::new(HeadlessRuntime::new()), BridgeConfig::default())
        .unwrap_err();
    assert!(matches!(
        again.downcast_ref::<BridgeError>(),
        Some(BridgeError::AlreadyInstalled)
    ));
    assert!(EventLoop::shared().is_ok());
}
