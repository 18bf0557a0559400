//! System browser launching

use tracing::warn;

/// Opens the authorization URL in the user's browser. Fire-and-forget:
/// the flow outcome arrives through the loopback callback, never through
/// this call.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str);
}

/// Launches the OS default browser
#[derive(Debug, Default)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) {
        if let Err(e) = open::that_detached(url) {
            warn!("Failed to open browser: {}", e);
        }
    }
}
