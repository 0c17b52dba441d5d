use std::convert::TryFrom;

use arrayref::{array_ref, array_refs};
use bytemuck::cast_ref;
use fixed::types::I80F48;
use solana_program::account_info::AccountInfo;
use solana_program::clock::Clock;
use solana_program::msg;
use solana_program::program_error::ProgramError;
use solana_program::pubkey::Pubkey;
use solana_program::rent::Rent;
use solana_program::sysvar::Sysvar;

use crate::error::{check_assert, MeridianErrorCode, MeridianResult, SourceFileId};
use crate::instruction::MeridianInstruction;
use crate::matching::{
    Book, BookSide, Order, OrderParams, PlaceOrderType, PostOrderType, SelfTradeBehavior, Side,
};
use crate::oracle::StubOracle;
use crate::queue::{EventQueue, EventType, FillEvent, OutEvent};
use crate::state::{DataType, MarginAccount, PerpMarket};

declare_check_assert_macros!(SourceFileId::Processor);

pub struct Processor {}

impl Processor {
    #[inline(never)]
    fn init_perp_market(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        base_lot_size: i64,
        quote_lot_size: i64,
        maker_fee: I80F48,
        taker_fee: I80F48,
    ) -> MeridianResult<()> {
        const NUM_FIXED: usize = 6;
        let accounts = array_ref![accounts, 0, NUM_FIXED];
        let [
            perp_market_ai,     // write
            bids_ai,            // write
            asks_ai,            // write
            event_queue_ai,     // write
            oracle_ai,          // read
            admin_ai,           // read, signer
        ] = accounts;

        check!(admin_ai.is_signer, MeridianErrorCode::SignerNecessary)?;
        let rent = Rent::get()?;

        let _perp_market = PerpMarket::load_and_init(
            perp_market_ai,
            program_id,
            admin_ai,
            oracle_ai,
            bids_ai,
            asks_ai,
            event_queue_ai,
            &rent,
            base_lot_size,
            quote_lot_size,
            maker_fee,
            taker_fee,
        )?;
        let _bids = BookSide::load_and_init(bids_ai, program_id, DataType::Bids, &rent)?;
        let _asks = BookSide::load_and_init(asks_ai, program_id, DataType::Asks, &rent)?;
        let _event_queue = EventQueue::load_and_init(event_queue_ai, program_id, &rent)?;

        Ok(())
    }

    #[inline(never)]
    fn init_margin_account(program_id: &Pubkey, accounts: &[AccountInfo]) -> MeridianResult<()> {
        const NUM_FIXED: usize = 3;
        let accounts = array_ref![accounts, 0, NUM_FIXED];
        let [
            perp_market_ai,     // read
            margin_account_ai,  // write
            owner_ai,           // read, signer
        ] = accounts;

        let _perp_market = PerpMarket::load_checked(perp_market_ai, program_id)?;
        let _margin_account = MarginAccount::load_and_init(
            margin_account_ai,
            program_id,
            perp_market_ai.key,
            owner_ai,
            &Rent::get()?,
        )?;

        Ok(())
    }

    #[inline(never)]
    fn set_stub_oracle(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        price: I80F48,
    ) -> MeridianResult<()> {
        const NUM_FIXED: usize = 3;
        let accounts = array_ref![accounts, 0, NUM_FIXED];
        let [
            perp_market_ai,     // read
            oracle_ai,          // write
            admin_ai,           // read, signer
        ] = accounts;

        let perp_market = PerpMarket::load_checked(perp_market_ai, program_id)?;
        check!(admin_ai.is_signer, MeridianErrorCode::SignerNecessary)?;
        check_eq!(&perp_market.admin, admin_ai.key, MeridianErrorCode::InvalidOwner)?;
        check_eq!(&perp_market.oracle, oracle_ai.key, MeridianErrorCode::InvalidAccount)?;

        let mut oracle = StubOracle::load_mut_checked(oracle_ai, program_id)?;
        if !oracle.meta_data.is_initialized {
            oracle.meta_data = crate::state::MetaData::new(DataType::StubOracle, 0, true);
        }
        check_eq!(
            oracle.meta_data.data_type,
            DataType::StubOracle as u8,
            MeridianErrorCode::InvalidAccountState
        )?;
        oracle.price = price;
        oracle.last_update = Clock::get()?.unix_timestamp as u64;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    #[inline(never)]
    fn place_perp_order(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        side: Side,
        price_lots: i64,
        max_base_quantity: i64,
        max_quote_quantity: i64,
        client_order_id: u64,
        order_type: PlaceOrderType,
        self_trade_behavior: SelfTradeBehavior,
        time_in_force: u16,
        limit: u8,
    ) -> MeridianResult<()> {
        check!(price_lots > 0, MeridianErrorCode::InvalidParam)?;
        check!(max_base_quantity > 0, MeridianErrorCode::InvalidParam)?;
        check!(limit > 0, MeridianErrorCode::InvalidParam)?;

        let params = match order_type {
            PlaceOrderType::Market => OrderParams::Market,
            PlaceOrderType::ImmediateOrCancel => OrderParams::ImmediateOrCancel { price_lots },
            PlaceOrderType::Limit => OrderParams::Fixed {
                price_lots,
                order_type: PostOrderType::Limit,
            },
            PlaceOrderType::PostOnly => OrderParams::Fixed {
                price_lots,
                order_type: PostOrderType::PostOnly,
            },
            PlaceOrderType::PostOnlySlide => OrderParams::Fixed {
                price_lots,
                order_type: PostOrderType::PostOnlySlide,
            },
        };
        let order = Order {
            side,
            max_base_quantity,
            max_quote_quantity,
            client_order_id,
            time_in_force,
            self_trade_behavior,
            params,
        };
        Self::place_order(program_id, accounts, order, limit)
    }

    #[allow(clippy::too_many_arguments)]
    #[inline(never)]
    fn place_perp_pegged_order(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
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
    ) -> MeridianResult<()> {
        check!(max_base_quantity > 0, MeridianErrorCode::InvalidParam)?;
        check!(peg_limit == -1 || peg_limit >= 1, MeridianErrorCode::InvalidParam)?;
        check!(limit > 0, MeridianErrorCode::InvalidParam)?;

        let order = Order {
            side,
            max_base_quantity,
            max_quote_quantity,
            client_order_id,
            time_in_force,
            self_trade_behavior,
            params: OrderParams::OraclePegged {
                price_offset_lots,
                order_type,
                peg_limit,
            },
        };
        Self::place_order(program_id, accounts, order, limit)
    }

    fn place_order(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        order: Order,
        limit: u8,
    ) -> MeridianResult<()> {
        const NUM_FIXED: usize = 7;
        let accounts = array_ref![accounts, 0, NUM_FIXED];
        let [
            perp_market_ai,     // write
            margin_account_ai,  // write
            owner_ai,           // read, signer
            bids_ai,            // write
            asks_ai,            // write
            event_queue_ai,     // write
            oracle_ai,          // read
        ] = accounts;

        let mut perp_market = PerpMarket::load_mut_checked(perp_market_ai, program_id)?;
        let mut margin_account =
            MarginAccount::load_mut_checked(margin_account_ai, program_id, perp_market_ai.key)?;
        check!(owner_ai.is_signer, MeridianErrorCode::SignerNecessary)?;
        check_eq!(&margin_account.owner, owner_ai.key, MeridianErrorCode::InvalidOwner)?;
        check_eq!(&perp_market.oracle, oracle_ai.key, MeridianErrorCode::InvalidAccount)?;

        let oracle = StubOracle::load_checked(oracle_ai, program_id)?;
        let oracle_price_lots = perp_market.native_price_to_lot(oracle.price)?;
        let now_ts = Clock::get()?.unix_timestamp as u64;

        let mut book = Book::load_checked(program_id, bids_ai, asks_ai, &perp_market)?;
        let mut event_queue =
            EventQueue::load_mut_checked(event_queue_ai, program_id, &perp_market)?;

        let summary = book.new_order(
            &order,
            &mut perp_market,
            &mut event_queue,
            oracle_price_lots,
            &mut margin_account,
            margin_account_ai.key,
            now_ts,
            limit,
        )?;

        if summary.not_posted_quantity > 0 {
            msg!(
                "{} lots were matched, {} lots could not rest on the book",
                summary.total_base_taken,
                summary.not_posted_quantity
            );
        }

        Ok(())
    }

    #[inline(never)]
    fn cancel_perp_order(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        order_id: u128,
    ) -> MeridianResult<()> {
        const NUM_FIXED: usize = 5;
        let accounts = array_ref![accounts, 0, NUM_FIXED];
        let [
            perp_market_ai,     // read
            margin_account_ai,  // write
            owner_ai,           // read, signer
            bids_ai,            // write
            asks_ai,            // write
        ] = accounts;

        let perp_market = PerpMarket::load_checked(perp_market_ai, program_id)?;
        let mut margin_account =
            MarginAccount::load_mut_checked(margin_account_ai, program_id, perp_market_ai.key)?;
        check!(owner_ai.is_signer, MeridianErrorCode::SignerNecessary)?;
        check_eq!(&margin_account.owner, owner_ai.key, MeridianErrorCode::InvalidOwner)?;

        let side_and_tree = margin_account
            .find_order_side_and_tree(order_id)
            .ok_or(throw_err!(MeridianErrorCode::InvalidOrderId))?;

        let mut book = Book::load_checked(program_id, bids_ai, asks_ai, &perp_market)?;
        let _order = book.cancel_order(
            &mut margin_account,
            order_id,
            side_and_tree,
            Some(*margin_account_ai.key),
        )?;

        Ok(())
    }

    #[inline(never)]
    fn cancel_perp_order_by_client_id(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        client_order_id: u64,
    ) -> MeridianResult<()> {
        const NUM_FIXED: usize = 5;
        let accounts = array_ref![accounts, 0, NUM_FIXED];
        let [
            perp_market_ai,     // read
            margin_account_ai,  // write
            owner_ai,           // read, signer
            bids_ai,            // write
            asks_ai,            // write
        ] = accounts;

        let perp_market = PerpMarket::load_checked(perp_market_ai, program_id)?;
        let mut margin_account =
            MarginAccount::load_mut_checked(margin_account_ai, program_id, perp_market_ai.key)?;
        check!(owner_ai.is_signer, MeridianErrorCode::SignerNecessary)?;
        check_eq!(&margin_account.owner, owner_ai.key, MeridianErrorCode::InvalidOwner)?;

        let (order_id, side_and_tree) = margin_account
            .find_order_with_client_id(client_order_id)
            .ok_or(throw_err!(MeridianErrorCode::ClientIdNotFound))?;

        let mut book = Book::load_checked(program_id, bids_ai, asks_ai, &perp_market)?;
        let _order = book.cancel_order(
            &mut margin_account,
            order_id,
            side_and_tree,
            Some(*margin_account_ai.key),
        )?;

        Ok(())
    }

    #[inline(never)]
    fn cancel_all_perp_orders(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        limit: u8,
    ) -> MeridianResult<()> {
        const NUM_FIXED: usize = 5;
        let accounts = array_ref![accounts, 0, NUM_FIXED];
        let [
            perp_market_ai,     // read
            margin_account_ai,  // write
            owner_ai,           // read, signer
            bids_ai,            // write
            asks_ai,            // write
        ] = accounts;

        let perp_market = PerpMarket::load_checked(perp_market_ai, program_id)?;
        let mut margin_account =
            MarginAccount::load_mut_checked(margin_account_ai, program_id, perp_market_ai.key)?;
        check!(owner_ai.is_signer, MeridianErrorCode::SignerNecessary)?;
        check_eq!(&margin_account.owner, owner_ai.key, MeridianErrorCode::InvalidOwner)?;

        let mut book = Book::load_checked(program_id, bids_ai, asks_ai, &perp_market)?;
        book.cancel_all_orders(&mut margin_account, margin_account_ai.key, limit)
    }

    #[inline(never)]
    fn consume_events(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        limit: usize,
    ) -> MeridianResult<()> {
        const NUM_FIXED: usize = 2;
        let (fixed_ais, margin_account_ais) = array_refs![accounts, NUM_FIXED; ..;];
        let [
            perp_market_ai,     // write
            event_queue_ai,     // write
        ] = fixed_ais;

        let mut perp_market = PerpMarket::load_mut_checked(perp_market_ai, program_id)?;
        let mut event_queue =
            EventQueue::load_mut_checked(event_queue_ai, program_id, &perp_market)?;

        let find_account = |key: &Pubkey| -> Option<&AccountInfo> {
            margin_account_ais.iter().find(|ai| ai.key == key)
        };

        for _ in 0..limit {
            let event = match event_queue.peek_front() {
                None => break,
                Some(e) => e,
            };

            match EventType::try_from(event.event_type).map_err(|_| throw!())? {
                EventType::Fill => {
                    let fill: &FillEvent = cast_ref(event);

                    if fill.maker == fill.taker {
                        // self-trade: both halves apply to the one account
                        let mut ma = match find_account(&fill.maker) {
                            Some(ai) => MarginAccount::load_mut_checked(
                                ai,
                                program_id,
                                perp_market_ai.key,
                            )?,
                            None => {
                                msg!("Unable to find account {}", fill.maker.to_string());
                                return Ok(()); // stop consuming, keep the event
                            }
                        };
                        ma.execute_maker(&mut perp_market, fill)?;
                        ma.execute_taker(&mut perp_market, fill)?;
                    } else {
                        let mut maker = match find_account(&fill.maker) {
                            Some(ai) => MarginAccount::load_mut_checked(
                                ai,
                                program_id,
                                perp_market_ai.key,
                            )?,
                            None => {
                                msg!("Unable to find maker account {}", fill.maker.to_string());
                                return Ok(());
                            }
                        };
                        let mut taker = match find_account(&fill.taker) {
                            Some(ai) => MarginAccount::load_mut_checked(
                                ai,
                                program_id,
                                perp_market_ai.key,
                            )?,
                            None => {
                                msg!("Unable to find taker account {}", fill.taker.to_string());
                                return Ok(());
                            }
                        };

                        maker.execute_maker(&mut perp_market, fill)?;
                        taker.execute_taker(&mut perp_market, fill)?;
                    }
                }
                EventType::Out => {
                    let out: &OutEvent = cast_ref(event);
                    let mut ma = match find_account(&out.owner) {
                        Some(ai) => {
                            MarginAccount::load_mut_checked(ai, program_id, perp_market_ai.key)?
                        }
                        None => {
                            msg!("Unable to find account {}", out.owner.to_string());
                            return Ok(());
                        }
                    };
                    ma.execute_out(out)?;
                }
            }

            // consume this event
            event_queue.pop_front().map_err(|_| throw!())?;
        }

        Ok(())
    }

    #[inline(never)]
    /// Update the funding accumulators of a PerpMarket from the current book
    /// and oracle index price
    fn update_funding(program_id: &Pubkey, accounts: &[AccountInfo]) -> MeridianResult<()> {
        const NUM_FIXED: usize = 4;
        let accounts = array_ref![accounts, 0, NUM_FIXED];
        let [
            perp_market_ai,     // write
            bids_ai,            // read
            asks_ai,            // read
            oracle_ai,          // read
        ] = accounts;

        let mut perp_market = PerpMarket::load_mut_checked(perp_market_ai, program_id)?;
        check_eq!(&perp_market.oracle, oracle_ai.key, MeridianErrorCode::InvalidAccount)?;
        let oracle = StubOracle::load_checked(oracle_ai, program_id)?;

        let book = Book::load_checked(program_id, bids_ai, asks_ai, &perp_market)?;

        let now_ts = Clock::get()?.unix_timestamp as u64;
        perp_market.update_funding(&book, oracle.price, now_ts)?;

        msg!(
            "{{\"long_funding\":{}, \"short_funding\":{}}}",
            perp_market.long_funding.to_num::<f64>(),
            perp_market.short_funding.to_num::<f64>()
        );

        Ok(())
    }

    pub fn process(program_id: &Pubkey, accounts: &[AccountInfo], data: &[u8]) -> MeridianResult<()> {
        let instruction =
            MeridianInstruction::unpack(data).ok_or(ProgramError::InvalidInstructionData)?;
        match instruction {
            MeridianInstruction::InitPerpMarket {
                base_lot_size,
                quote_lot_size,
                maker_fee,
                taker_fee,
            } => {
                msg!("Meridian: InitPerpMarket");
                Self::init_perp_market(
                    program_id,
                    accounts,
                    base_lot_size,
                    quote_lot_size,
                    maker_fee,
                    taker_fee,
                )
            }
            MeridianInstruction::InitMarginAccount => {
                msg!("Meridian: InitMarginAccount");
                Self::init_margin_account(program_id, accounts)
            }
            MeridianInstruction::SetStubOracle { price } => {
                msg!("Meridian: SetStubOracle");
                Self::set_stub_oracle(program_id, accounts, price)
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
                msg!("Meridian: PlacePerpOrder client_order_id={}", client_order_id);
                Self::place_perp_order(
                    program_id,
                    accounts,
                    side,
                    price_lots,
                    max_base_quantity,
                    max_quote_quantity,
                    client_order_id,
                    order_type,
                    self_trade_behavior,
                    time_in_force,
                    limit,
                )
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
                msg!(
                    "Meridian: PlacePerpPeggedOrder client_order_id={}",
                    client_order_id
                );
                Self::place_perp_pegged_order(
                    program_id,
                    accounts,
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
                )
            }
            MeridianInstruction::CancelPerpOrder { order_id } => {
                msg!("Meridian: CancelPerpOrder order_id={}", order_id);
                Self::cancel_perp_order(program_id, accounts, order_id)
            }
            MeridianInstruction::CancelPerpOrderByClientId { client_order_id } => {
                msg!(
                    "Meridian: CancelPerpOrderByClientId client_order_id={}",
                    client_order_id
                );
                Self::cancel_perp_order_by_client_id(program_id, accounts, client_order_id)
            }
            MeridianInstruction::CancelAllPerpOrders { limit } => {
                msg!("Meridian: CancelAllPerpOrders");
                Self::cancel_all_perp_orders(program_id, accounts, limit)
            }
            MeridianInstruction::ConsumeEvents { limit } => {
                msg!("Meridian: ConsumeEvents");
                Self::consume_events(program_id, accounts, limit)
            }
            MeridianInstruction::UpdateFunding => {
                msg!("Meridian: UpdateFunding");
                Self::update_funding(program_id, accounts)
            }
        }
    }
}

pub fn process(program_id: &Pubkey, accounts: &[AccountInfo], data: &[u8]) -> MeridianResult<()> {
    Processor::process(program_id, accounts, data)
}
