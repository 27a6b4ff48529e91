//! Presenting interactive sign-in to the user.

use tracing::{debug, warn};

/// Device authorization details returned by the identity platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeInfo {
    pub user_code: String,
    pub verification_uri: String,
    /// Seconds until the device code expires.
    pub expires_in: u64,
    /// Human-readable instructions composed by the service.
    pub message: Option<String>,
}

impl DeviceCodeInfo {
    /// Verification URL with the user code prefilled.
    pub fn verification_url_with_code(&self) -> String {
        format!("{}?user_code={}", self.verification_uri, self.user_code)
    }
}

/// Shows the user what to do for an interactive sign-in.
pub trait SignInPrompt: Send + Sync {
    /// Device-code flow: tell the user where to enter the code.
    fn show_device_code(&self, info: &DeviceCodeInfo);

    /// Redirect flow: send the user to the authorization page.
    fn open_authorization_url(&self, url: &str);
}

/// Writes instructions to stderr and optionally opens the browser.
#[derive(Debug, Clone, Default)]
pub struct ConsolePrompt {
    open_browser: bool,
}

impl ConsolePrompt {
    pub fn new(open_browser: bool) -> Self {
        Self { open_browser }
    }

    fn open(&self, url: &str) -> bool {
        if !self.open_browser {
            return false;
        }

        debug!("Opening {} in the default browser", url);
        match open::that(url) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to open browser: {}", e);
                false
            }
        }
    }
}

impl SignInPrompt for ConsolePrompt {
    fn show_device_code(&self, info: &DeviceCodeInfo) {
        eprintln!();
        match &info.message {
            Some(message) => eprintln!("{message}"),
            None => eprintln!(
                "Open {} and enter the code {}",
                info.verification_uri, info.user_code
            ),
        }

        self.open(&info.verification_url_with_code());
    }

    fn open_authorization_url(&self, url: &str) {
        eprintln!();
        if self.open(url) {
            eprintln!("Continue signing in in your browser.");
        } else {
            eprintln!("Open this URL in a browser to sign in:\n{url}");
        }
    }
}
