//! Common functionality and types shared across the server.

use console::Emoji;

pub static SERVER: Emoji = Emoji("📡 ", "");
pub static ERROR: Emoji = Emoji("❌ ", "");
pub static NETWORK: Emoji = Emoji("💻 ", "");
pub static STARTING: Emoji = Emoji("🚀 ", "");
