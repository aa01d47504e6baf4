pub mod browser;
pub mod panel;
pub mod render;

pub use browser::{PrintOnlyBrowser, SystemBrowser};
pub use panel::{auth_label, Panel, PanelCommand};
pub use render::TerminalRenderer;
