#[macro_use]
pub mod error;

pub mod critbit;
pub mod instruction;
pub mod matching;
pub mod oracle;
pub mod processor;
pub mod queue;
pub mod state;
pub mod utils;

#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint;

use solana_program::declare_id;

#[cfg(feature = "devnet")]
declare_id!("EkmFNm7wu55PJA33KsfTkA2eUQFRRefVcdMGWSXhEBSL");
#[cfg(not(feature = "devnet"))]
declare_id!("AnZ6rNBegjRJo3J4YMBGhiYYitJzuVya4vqi3UavR2LJ");
