mod beat;
mod conversation;
mod ledger;
mod license;
mod money;
mod optimistic;
mod player;
mod profile;
mod purchase;

pub use beat::*;
pub use conversation::*;
pub use ledger::*;
pub use license::*;
pub use money::*;
pub use optimistic::*;
pub use player::*;
pub use profile::*;
pub use purchase::*;
