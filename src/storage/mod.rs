mod disk;
mod layout;
mod piece_store;

pub use disk::Storage;
pub use layout::FileLayout;
pub use piece_store::{PieceState, PieceStore};
