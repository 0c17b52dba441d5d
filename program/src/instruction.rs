use std::convert::TryFrom;

use arrayref::{array_ref, array_refs};
use fixed::types::I80F48;
use serde::{Deserialize, Serialize};
use solana_program::instruction::{AccountMeta, Instruction};
use solana_program::program_error::ProgramError;
use solana_program::pubkey::Pubkey;

use crate::matching::{PlaceOrderType, PostOrderType, SelfTradeBehavior, Side};

#[repr(C)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MeridianInstruction {
    /// Initialize a perp market together with its book sides and event queue
    ///
    /// Accounts expected by this instruction (6):
    ///
    /// 0. `[writable]` perp_market_ai
    /// 1. `[writable]` bids_ai
    /// 2. `[writable]` asks_ai
    /// 3. `[writable]` event_queue_ai
    /// 4. `[]` oracle_ai - reference price account for this market
    /// 5. `[signer]` admin_ai
    InitPerpMarket {
        base_lot_size: i64,
        quote_lot_size: i64,
        maker_fee: I80F48,
        taker_fee: I80F48,
    },

    /// Initialize a margin account for a user on one market
    ///
    /// Accounts expected by this instruction (3):
    ///
    /// 0. `[]` perp_market_ai
    /// 1. `[writable]` margin_account_ai
    /// 2. `[signer]` owner_ai
    InitMarginAccount,

    /// Set the stub oracle price; initializes the oracle on first use
    ///
    /// Accounts expected by this instruction (3):
    ///
    /// 0. `[]` perp_market_ai
    /// 1. `[writable]` oracle_ai
    /// 2. `[signer]` admin_ai - must match perp_market.admin
    SetStubOracle { price: I80F48 },

    /// Place an order with a fixed limit price
    ///
    /// Accounts expected by this instruction (7):
    ///
    /// 0. `[writable]` perp_market_ai
    /// 1. `[writable]` margin_account_ai
    /// 2. `[signer]` owner_ai
    /// 3. `[writable]` bids_ai
    /// 4. `[writable]` asks_ai
    /// 5. `[writable]` event_queue_ai
    /// 6. `[]` oracle_ai
    PlacePerpOrder {
        side: Side,
        price_lots: i64,
        max_base_quantity: i64,
        max_quote_quantity: i64,
        client_order_id: u64,
        order_type: PlaceOrderType,
        self_trade_behavior: SelfTradeBehavior,
        time_in_force: u16,
        /// maximum number of fills before matching stops; the caller
        /// re-invokes to continue
        limit: u8,
    },

    /// Place an order priced relative to the oracle
    ///
    /// Accounts expected by this instruction (7): same as PlacePerpOrder
    PlacePerpPeggedOrder {
        side: Side,
        price_offset_lots: i64,
        /// worst price the order may trade at, -1 for no limit
        peg_limit: i64,
        max_base_quantity: i64,
        max_quote_quantity: i64,
        client_order_id: u64,
        order_type: PostOrderType,
        self_trade_behavior: SelfTradeBehavior,
        time_in_force: u16,
        limit: u8,
    },

    /// Cancel a resting order by its order id
    ///
    /// Accounts expected by this instruction (5):
    ///
    /// 0. `[]` perp_market_ai
    /// 1. `[writable]` margin_account_ai
    /// 2. `[signer]` owner_ai
    /// 3. `[writable]` bids_ai
    /// 4. `[writable]` asks_ai
    CancelPerpOrder { order_id: u128 },

    /// Cancel a resting order by the client-assigned id
    ///
    /// Accounts expected by this instruction (5): same as CancelPerpOrder
    CancelPerpOrderByClientId { client_order_id: u64 },

    /// Cancel up to `limit` of the account's resting orders
    ///
    /// Accounts expected by this instruction (5): same as CancelPerpOrder
    CancelAllPerpOrders { limit: u8 },

    /// Drain up to `limit` events from the event queue and apply them to the
    /// margin accounts passed behind the fixed accounts
    ///
    /// Accounts expected by this instruction (2 + n):
    ///
    /// 0. `[writable]` perp_market_ai
    /// 1. `[writable]` event_queue_ai
    /// 2... `[writable]` margin_account_ais - accounts referenced by events
    ConsumeEvents { limit: usize },

    /// Recompute the funding accumulators from the book and the oracle
    ///
    /// Accounts expected by this instruction (4):
    ///
    /// 0. `[writable]` perp_market_ai
    /// 1. `[]` bids_ai
    /// 2. `[]` asks_ai
    /// 3. `[]` oracle_ai
    UpdateFunding,
}

impl MeridianInstruction {
    pub fn unpack(input: &[u8]) -> Option<Self> {
        let (&discrim, data) = array_refs![input, 4; ..;];
        let discrim = u32::from_le_bytes(discrim);
        Some(match discrim {
            0 => {
                let data = array_ref![data, 0, 48];
                let (base_lot_size, quote_lot_size, maker_fee, taker_fee) =
                    array_refs![data, 8, 8, 16, 16];
                MeridianInstruction::InitPerpMarket {
                    base_lot_size: i64::from_le_bytes(*base_lot_size),
                    quote_lot_size: i64::from_le_bytes(*quote_lot_size),
                    maker_fee: I80F48::from_le_bytes(*maker_fee),
                    taker_fee: I80F48::from_le_bytes(*taker_fee),
                }
            }
            1 => MeridianInstruction::InitMarginAccount,
            2 => {
                let price = array_ref![data, 0, 16];
                MeridianInstruction::SetStubOracle {
                    price: I80F48::from_le_bytes(*price),
                }
            }
            3 => {
                let data = array_ref![data, 0, 38];
                let (
                    side,
                    price_lots,
                    max_base_quantity,
                    max_quote_quantity,
                    client_order_id,
                    order_type,
                    self_trade_behavior,
                    time_in_force,
                    limit,
                ) = array_refs![data, 1, 8, 8, 8, 8, 1, 1, 2, 1];
                MeridianInstruction::PlacePerpOrder {
                    side: Side::try_from(side[0]).ok()?,
                    price_lots: i64::from_le_bytes(*price_lots),
                    max_base_quantity: i64::from_le_bytes(*max_base_quantity),
                    max_quote_quantity: i64::from_le_bytes(*max_quote_quantity),
                    client_order_id: u64::from_le_bytes(*client_order_id),
                    order_type: PlaceOrderType::try_from(order_type[0]).ok()?,
                    self_trade_behavior: SelfTradeBehavior::try_from(self_trade_behavior[0]).ok()?,
                    time_in_force: u16::from_le_bytes(*time_in_force),
                    limit: limit[0],
                }
            }
            4 => {
                let data = array_ref![data, 0, 46];
                let (
                    side,
                    price_offset_lots,
                    peg_limit,
                    max_base_quantity,
                    max_quote_quantity,
                    client_order_id,
                    order_type,
                    self_trade_behavior,
                    time_in_force,
                    limit,
                ) = array_refs![data, 1, 8, 8, 8, 8, 8, 1, 1, 2, 1];
                MeridianInstruction::PlacePerpPeggedOrder {
                    side: Side::try_from(side[0]).ok()?,
                    price_offset_lots: i64::from_le_bytes(*price_offset_lots),
                    peg_limit: i64::from_le_bytes(*peg_limit),
                    max_base_quantity: i64::from_le_bytes(*max_base_quantity),
                    max_quote_quantity: i64::from_le_bytes(*max_quote_quantity),
                    client_order_id: u64::from_le_bytes(*client_order_id),
                    order_type: PostOrderType::try_from(order_type[0]).ok()?,
                    self_trade_behavior: SelfTradeBehavior::try_from(self_trade_behavior[0]).ok()?,
                    time_in_force: u16::from_le_bytes(*time_in_force),
                    limit: limit[0],
                }
            }
            5 => {
                let order_id = array_ref![data, 0, 16];
                MeridianInstruction::CancelPerpOrder {
                    order_id: u128::from_le_bytes(*order_id),
                }
            }
            6 => {
                let client_order_id = array_ref![data, 0, 8];
                MeridianInstruction::CancelPerpOrderByClientId {
                    client_order_id: u64::from_le_bytes(*client_order_id),
                }
            }
            7 => {
                let limit = array_ref![data, 0, 1];
                MeridianInstruction::CancelAllPerpOrders { limit: limit[0] }
            }
            8 => {
                let limit = array_ref![data, 0, 8];
                MeridianInstruction::ConsumeEvents {
                    limit: u64::from_le_bytes(*limit) as usize,
                }
            }
            9 => MeridianInstruction::UpdateFunding,
            _ => {
                return None;
            }
        })
    }

    /// Mirrors `unpack` byte for byte.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            MeridianInstruction::InitPerpMarket {
                base_lot_size,
                quote_lot_size,
                maker_fee,
                taker_fee,
            } => {
                buf.extend_from_slice(&0u32.to_le_bytes());
                buf.extend_from_slice(&base_lot_size.to_le_bytes());
                buf.extend_from_slice(&quote_lot_size.to_le_bytes());
                buf.extend_from_slice(&maker_fee.to_le_bytes());
                buf.extend_from_slice(&taker_fee.to_le_bytes());
            }
            MeridianInstruction::InitMarginAccount => {
                buf.extend_from_slice(&1u32.to_le_bytes());
            }
            MeridianInstruction::SetStubOracle { price } => {
                buf.extend_from_slice(&2u32.to_le_bytes());
                buf.extend_from_slice(&price.to_le_bytes());
            }
            MeridianInstruction::PlacePerpOrder {
                side,
                price_lots,
                max_base_quantity,
                max_quote_quantity,
                client_order_id,
                order_type,
                self_trade_behavior,
                time_in_force,
                limit,
            } => {
                buf.extend_from_slice(&3u32.to_le_bytes());
                buf.push(*side as u8);
                buf.extend_from_slice(&price_lots.to_le_bytes());
                buf.extend_from_slice(&max_base_quantity.to_le_bytes());
                buf.extend_from_slice(&max_quote_quantity.to_le_bytes());
                buf.extend_from_slice(&client_order_id.to_le_bytes());
                buf.push(*order_type as u8);
                buf.push(*self_trade_behavior as u8);
                buf.extend_from_slice(&time_in_force.to_le_bytes());
                buf.push(*limit);
            }
            MeridianInstruction::PlacePerpPeggedOrder {
                side,
                price_offset_lots,
                peg_limit,
                max_base_quantity,
                max_quote_quantity,
                client_order_id,
                order_type,
                self_trade_behavior,
                time_in_force,
                limit,
            } => {
                buf.extend_from_slice(&4u32.to_le_bytes());
                buf.push(*side as u8);
                buf.extend_from_slice(&price_offset_lots.to_le_bytes());
                buf.extend_from_slice(&peg_limit.to_le_bytes());
                buf.extend_from_slice(&max_base_quantity.to_le_bytes());
                buf.extend_from_slice(&max_quote_quantity.to_le_bytes());
                buf.extend_from_slice(&client_order_id.to_le_bytes());
                buf.push(*order_type as u8);
                buf.push(*self_trade_behavior as u8);
                buf.extend_from_slice(&time_in_force.to_le_bytes());
                buf.push(*limit);
            }
            MeridianInstruction::CancelPerpOrder { order_id } => {
                buf.extend_from_slice(&5u32.to_le_bytes());
                buf.extend_from_slice(&order_id.to_le_bytes());
            }
            MeridianInstruction::CancelPerpOrderByClientId { client_order_id } => {
                buf.extend_from_slice(&6u32.to_le_bytes());
                buf.extend_from_slice(&client_order_id.to_le_bytes());
            }
            MeridianInstruction::CancelAllPerpOrders { limit } => {
                buf.extend_from_slice(&7u32.to_le_bytes());
                buf.push(*limit);
            }
            MeridianInstruction::ConsumeEvents { limit } => {
                buf.extend_from_slice(&8u32.to_le_bytes());
                buf.extend_from_slice(&(*limit as u64).to_le_bytes());
            }
            MeridianInstruction::UpdateFunding => {
                buf.extend_from_slice(&9u32.to_le_bytes());
            }
        }
        buf
    }
}

#[allow(clippy::too_many_arguments)]
pub fn init_perp_market(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    bids_pk: &Pubkey,
    asks_pk: &Pubkey,
    event_queue_pk: &Pubkey,
    oracle_pk: &Pubkey,
    admin_pk: &Pubkey,

    base_lot_size: i64,
    quote_lot_size: i64,
    maker_fee: I80F48,
    taker_fee: I80F48,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*perp_market_pk, false),
        AccountMeta::new(*bids_pk, false),
        AccountMeta::new(*asks_pk, false),
        AccountMeta::new(*event_queue_pk, false),
        AccountMeta::new_readonly(*oracle_pk, false),
        AccountMeta::new_readonly(*admin_pk, true),
    ];

    let instr = MeridianInstruction::InitPerpMarket {
        base_lot_size,
        quote_lot_size,
        maker_fee,
        taker_fee,
    };

    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

pub fn init_margin_account(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    margin_account_pk: &Pubkey,
    owner_pk: &Pubkey,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*perp_market_pk, false),
        AccountMeta::new(*margin_account_pk, false),
        AccountMeta::new_readonly(*owner_pk, true),
    ];

    let instr = MeridianInstruction::InitMarginAccount;
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

pub fn set_stub_oracle(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    oracle_pk: &Pubkey,
    admin_pk: &Pubkey,
    price: I80F48,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*perp_market_pk, false),
        AccountMeta::new(*oracle_pk, false),
        AccountMeta::new_readonly(*admin_pk, true),
    ];

    let instr = MeridianInstruction::SetStubOracle { price };
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn place_perp_order(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    margin_account_pk: &Pubkey,
    owner_pk: &Pubkey,
    bids_pk: &Pubkey,
    asks_pk: &Pubkey,
    event_queue_pk: &Pubkey,
    oracle_pk: &Pubkey,

    side: Side,
    price_lots: i64,
    max_base_quantity: i64,
    max_quote_quantity: i64,
    client_order_id: u64,
    order_type: PlaceOrderType,
    self_trade_behavior: SelfTradeBehavior,
    time_in_force: u16,
    limit: u8,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*perp_market_pk, false),
        AccountMeta::new(*margin_account_pk, false),
        AccountMeta::new_readonly(*owner_pk, true),
        AccountMeta::new(*bids_pk, false),
        AccountMeta::new(*asks_pk, false),
        AccountMeta::new(*event_queue_pk, false),
        AccountMeta::new_readonly(*oracle_pk, false),
    ];

    let instr = MeridianInstruction::PlacePerpOrder {
        side,
        price_lots,
        max_base_quantity,
        max_quote_quantity,
        client_order_id,
        order_type,
        self_trade_behavior,
        time_in_force,
        limit,
    };
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn place_perp_pegged_order(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    margin_account_pk: &Pubkey,
    owner_pk: &Pubkey,
    bids_pk: &Pubkey,
    asks_pk: &Pubkey,
    event_queue_pk: &Pubkey,
    oracle_pk: &Pubkey,

    side: Side,
    price_offset_lots: i64,
    peg_limit: i64,
    max_base_quantity: i64,
    max_quote_quantity: i64,
    client_order_id: u64,
    order_type: PostOrderType,
    self_trade_behavior: SelfTradeBehavior,
    time_in_force: u16,
    limit: u8,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*perp_market_pk, false),
        AccountMeta::new(*margin_account_pk, false),
        AccountMeta::new_readonly(*owner_pk, true),
        AccountMeta::new(*bids_pk, false),
        AccountMeta::new(*asks_pk, false),
        AccountMeta::new(*event_queue_pk, false),
        AccountMeta::new_readonly(*oracle_pk, false),
    ];

    let instr = MeridianInstruction::PlacePerpPeggedOrder {
        side,
        price_offset_lots,
        peg_limit,
        max_base_quantity,
        max_quote_quantity,
        client_order_id,
        order_type,
        self_trade_behavior,
        time_in_force,
        limit,
    };
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

pub fn cancel_perp_order(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    margin_account_pk: &Pubkey,
    owner_pk: &Pubkey,
    bids_pk: &Pubkey,
    asks_pk: &Pubkey,
    order_id: u128,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*perp_market_pk, false),
        AccountMeta::new(*margin_account_pk, false),
        AccountMeta::new_readonly(*owner_pk, true),
        AccountMeta::new(*bids_pk, false),
        AccountMeta::new(*asks_pk, false),
    ];

    let instr = MeridianInstruction::CancelPerpOrder { order_id };
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

pub fn cancel_perp_order_by_client_id(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    margin_account_pk: &Pubkey,
    owner_pk: &Pubkey,
    bids_pk: &Pubkey,
    asks_pk: &Pubkey,
    client_order_id: u64,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*perp_market_pk, false),
        AccountMeta::new(*margin_account_pk, false),
        AccountMeta::new_readonly(*owner_pk, true),
        AccountMeta::new(*bids_pk, false),
        AccountMeta::new(*asks_pk, false),
    ];

    let instr = MeridianInstruction::CancelPerpOrderByClientId { client_order_id };
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

pub fn cancel_all_perp_orders(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    margin_account_pk: &Pubkey,
    owner_pk: &Pubkey,
    bids_pk: &Pubkey,
    asks_pk: &Pubkey,
    limit: u8,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new_readonly(*perp_market_pk, false),
        AccountMeta::new(*margin_account_pk, false),
        AccountMeta::new_readonly(*owner_pk, true),
        AccountMeta::new(*bids_pk, false),
        AccountMeta::new(*asks_pk, false),
    ];

    let instr = MeridianInstruction::CancelAllPerpOrders { limit };
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

pub fn consume_events(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    event_queue_pk: &Pubkey,
    margin_account_pks: &mut [Pubkey],
    limit: usize,
) -> Result<Instruction, ProgramError> {
    let mut accounts = vec![
        AccountMeta::new(*perp_market_pk, false),
        AccountMeta::new(*event_queue_pk, false),
    ];
    accounts.extend(
        margin_account_pks
            .iter()
            .map(|pk| AccountMeta::new(*pk, false)),
    );

    let instr = MeridianInstruction::ConsumeEvents { limit };
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

pub fn update_funding(
    program_id: &Pubkey,
    perp_market_pk: &Pubkey,
    bids_pk: &Pubkey,
    asks_pk: &Pubkey,
    oracle_pk: &Pubkey,
) -> Result<Instruction, ProgramError> {
    let accounts = vec![
        AccountMeta::new(*perp_market_pk, false),
        AccountMeta::new_readonly(*bids_pk, false),
        AccountMeta::new_readonly(*asks_pk, false),
        AccountMeta::new_readonly(*oracle_pk, false),
    ];

    let instr = MeridianInstruction::UpdateFunding;
    let data = instr.pack();
    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let instructions = vec![
            MeridianInstruction::InitPerpMarket {
                base_lot_size: 10,
                quote_lot_size: 100,
                maker_fee: I80F48::from_num(-0.0004),
                taker_fee: I80F48::from_num(0.0005),
            },
            MeridianInstruction::InitMarginAccount,
            MeridianInstruction::SetStubOracle {
                price: I80F48::from_num(4321.5),
            },
            MeridianInstruction::PlacePerpOrder {
                side: Side::Ask,
                price_lots: 1250,
                max_base_quantity: 5,
                max_quote_quantity: i64::MAX,
                client_order_id: 77,
                order_type: PlaceOrderType::PostOnlySlide,
                self_trade_behavior: SelfTradeBehavior::CancelProvide,
                time_in_force: 30,
                limit: 8,
            },
            MeridianInstruction::PlacePerpPeggedOrder {
                side: Side::Bid,
                price_offset_lots: -25,
                peg_limit: 1200,
                max_base_quantity: 5,
                max_quote_quantity: 500,
                client_order_id: 78,
                order_type: PostOrderType::Limit,
                self_trade_behavior: SelfTradeBehavior::DecrementTake,
                time_in_force: 0,
                limit: 255,
            },
            MeridianInstruction::CancelPerpOrder {
                order_id: u128::MAX - 5,
            },
            MeridianInstruction::CancelPerpOrderByClientId {
                client_order_id: 77,
            },
            MeridianInstruction::CancelAllPerpOrders { limit: 20 },
            MeridianInstruction::ConsumeEvents { limit: 12 },
            MeridianInstruction::UpdateFunding,
        ];

        for instr in instructions {
            let packed = instr.pack();
            let unpacked = MeridianInstruction::unpack(&packed).unwrap();
            assert_eq!(instr, unpacked);
        }
    }

    #[test]
    fn unpack_rejects_garbage() {
        assert_eq!(MeridianInstruction::unpack(&99u32.to_le_bytes()), None);
    }
}
