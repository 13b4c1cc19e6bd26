mod codec;
mod crypto;
mod peer_id;
mod transfer_rate;

pub use codec::*;
pub use crypto::*;
pub use peer_id::*;
pub use transfer_rate::*;
