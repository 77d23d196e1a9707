pub mod viewport_anchor;

pub use viewport_anchor::{FeedItem, JumpTarget, ScrollAnchor, ViewportAnchorController};
