pub mod launch;

#[cfg(feature = "browser")]
pub mod browser;

pub use launch::LaunchOptions;

#[cfg(feature = "browser")]
pub use browser::{BrowserFactory, BrowserSession, ScopedPage};
