pub mod shortcuts;

pub use shortcuts::ShortcutProvider;
