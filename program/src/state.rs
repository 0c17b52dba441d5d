use std::cell::{Ref, RefMut};
use std::cmp::Ordering;
use std::convert::TryFrom;

use fixed::types::I80F48;
use fixed_macro::types::I80F48;
use solana_program::account_info::AccountInfo;
use solana_program::pubkey::Pubkey;
use solana_program::rent::Rent;

use meridian_common::Loadable;
use meridian_macro::{Loadable, Pod};

use crate::critbit::LeafNode;
use crate::error::{check_assert, MeridianErrorCode, MeridianResult, SourceFileId};
use crate::matching::{Book, BookSideOrderTree, Side, SideAndOrderTree};
use crate::queue::{FillEvent, OutEvent};

declare_check_assert_macros!(SourceFileId::State);

pub const MAX_OPEN_ORDERS: usize = 64;

/// Marker for an unused entry in MarginAccount::orders; a real order id is
/// never 0 because the market's sequence number starts at 1.
pub const FREE_ORDER_SLOT: u128 = 0;

pub const ZERO_I80F48: I80F48 = I80F48!(0);
pub const ONE_I80F48: I80F48 = I80F48!(1);
pub const DAY: I80F48 = I80F48!(86400);

/// Number of base lots walked into the book when computing the funding
/// book price.
pub const IMPACT_QUANTITY: i64 = 100;

pub const MAX_FUNDING: I80F48 = I80F48!(0.05);
pub const MIN_FUNDING: I80F48 = I80F48!(-0.05);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DataType {
    PerpMarket = 0,
    MarginAccount,
    Bids,
    Asks,
    EventQueue,
    StubOracle,
}

impl TryFrom<u8> for DataType {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(DataType::PerpMarket),
            1 => Ok(DataType::MarginAccount),
            2 => Ok(DataType::Bids),
            3 => Ok(DataType::Asks),
            4 => Ok(DataType::EventQueue),
            5 => Ok(DataType::StubOracle),
            _ => Err(()),
        }
    }
}

#[derive(Copy, Clone, Pod)]
#[repr(C)]
pub struct MetaData {
    pub data_type: u8,
    pub version: u8,
    pub is_initialized: bool,
    pub extra_info: [u8; 5],
}

impl MetaData {
    pub fn new(data_type: DataType, version: u8, is_initialized: bool) -> Self {
        Self {
            data_type: data_type as u8,
            version,
            is_initialized,
            extra_info: [0; 5],
        }
    }
}

/// Top level info about one perpetual market. All transactions on a market
/// serialize on this account because it is always passed in as writable.
#[derive(Copy, Clone, Pod, Loadable)]
#[repr(C)]
pub struct PerpMarket {
    pub meta_data: MetaData,

    pub admin: Pubkey,
    pub oracle: Pubkey,
    pub bids: Pubkey,
    pub asks: Pubkey,
    pub event_queue: Pubkey,

    /// number of quote native units that represent one price lot
    pub quote_lot_size: i64,
    /// number of base native units per base lot; greater than 0
    pub base_lot_size: i64,
    pub padding0: [u8; 8],

    pub maker_fee: I80F48,
    pub taker_fee: I80F48,

    pub long_funding: I80F48,
    pub short_funding: I80F48,
    pub funding_last_updated: u64,

    pub open_interest: i64, // kept in base lot units, always >= 0
    pub seq_num: u64,
    pub padding1: [u8; 8],
    pub fees_accrued: I80F48, // native quote units
}

impl PerpMarket {
    pub fn load_checked<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
    ) -> MeridianResult<Ref<'a, Self>> {
        check_eq!(account.owner, program_id, MeridianErrorCode::InvalidOwner)?;
        let state = Self::load(account)?;
        check!(state.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;
        check_eq!(
            state.meta_data.data_type,
            DataType::PerpMarket as u8,
            MeridianErrorCode::InvalidAccountState
        )?;
        Ok(state)
    }

    pub fn load_mut_checked<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
    ) -> MeridianResult<RefMut<'a, Self>> {
        check_eq!(account.owner, program_id, MeridianErrorCode::InvalidOwner)?;
        let state = Self::load_mut(account)?;
        check!(state.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;
        check_eq!(
            state.meta_data.data_type,
            DataType::PerpMarket as u8,
            MeridianErrorCode::InvalidAccountState
        )?;
        Ok(state)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn load_and_init<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
        admin_ai: &'a AccountInfo,
        oracle_ai: &'a AccountInfo,
        bids_ai: &'a AccountInfo,
        asks_ai: &'a AccountInfo,
        event_queue_ai: &'a AccountInfo,
        rent: &Rent,
        base_lot_size: i64,
        quote_lot_size: i64,
        maker_fee: I80F48,
        taker_fee: I80F48,
    ) -> MeridianResult<RefMut<'a, Self>> {
        check!(
            rent.is_exempt(account.lamports(), account.data_len()),
            MeridianErrorCode::AccountNotRentExempt
        )?;
        check_eq!(account.owner, program_id, MeridianErrorCode::InvalidOwner)?;

        let mut state = Self::load_mut(account)?;
        check!(!state.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;
        check!(base_lot_size > 0 && quote_lot_size > 0, MeridianErrorCode::InvalidParam)?;

        state.meta_data = MetaData::new(DataType::PerpMarket, 0, true);
        state.admin = *admin_ai.key;
        state.oracle = *oracle_ai.key;
        state.bids = *bids_ai.key;
        state.asks = *asks_ai.key;
        state.event_queue = *event_queue_ai.key;
        state.base_lot_size = base_lot_size;
        state.quote_lot_size = quote_lot_size;
        state.maker_fee = maker_fee;
        state.taker_fee = taker_fee;

        Ok(state)
    }

    /// Sequence numbers fill the low 64 bits of the order key. Bids store the
    /// bitwise complement so that among equal prices the earliest order has
    /// the larger key and wins the max walk.
    pub fn gen_order_id(&mut self, side: Side, price_data: u64) -> u128 {
        self.seq_num += 1;

        let upper = (price_data as u128) << 64;
        match side {
            Side::Bid => upper | ((!self.seq_num) as u128),
            Side::Ask => upper | (self.seq_num as u128),
        }
    }

    /// Convert from the price stored on the book to the price used in value calculations
    pub fn lot_to_native_price(&self, price: i64) -> I80F48 {
        I80F48::from_num(price)
            .checked_mul(I80F48::from_num(self.quote_lot_size))
            .unwrap()
            .checked_div(I80F48::from_num(self.base_lot_size))
            .unwrap()
    }

    pub fn native_price_to_lot(&self, price: I80F48) -> MeridianResult<i64> {
        Ok(price
            .checked_mul(I80F48::from_num(self.base_lot_size))
            .ok_or(math_err!())?
            .checked_div(I80F48::from_num(self.quote_lot_size))
            .ok_or(math_err!())?
            .to_num())
    }

    /// Use the current order book and the oracle index price to accrue the
    /// instantaneous funding rate.
    pub fn update_funding(
        &mut self,
        book: &Book,
        index_price: I80F48,
        now_ts: u64,
    ) -> MeridianResult<()> {
        let oracle_price_lots = self.native_price_to_lot(index_price)?;
        let bid = book.get_impact_price(Side::Bid, IMPACT_QUANTITY, now_ts, oracle_price_lots);
        let ask = book.get_impact_price(Side::Ask, IMPACT_QUANTITY, now_ts, oracle_price_lots);

        let diff = match (bid, ask) {
            (Some(bid), Some(ask)) => {
                let book_price = self.lot_to_native_price((bid + ask) / 2);
                (book_price / index_price - ONE_I80F48).clamp(MIN_FUNDING, MAX_FUNDING)
            }
            (Some(_bid), None) => MAX_FUNDING,
            (None, Some(_ask)) => MIN_FUNDING,
            (None, None) => ZERO_I80F48,
        };

        let time_factor = I80F48::from_num(now_ts - self.funding_last_updated) / DAY;
        let funding_delta: I80F48 = index_price
            .checked_mul(diff)
            .ok_or(math_err!())?
            .checked_mul(I80F48::from_num(self.base_lot_size))
            .ok_or(math_err!())?
            .checked_mul(time_factor)
            .ok_or(math_err!())?;

        self.long_funding += funding_delta;
        self.short_funding += funding_delta;
        self.funding_last_updated = now_ts;

        Ok(())
    }
}

/// Position and pending-settlement state of one account on one market.
#[derive(Copy, Clone, Pod)]
#[repr(C)]
pub struct PerpPosition {
    pub base_position: i64, // base lots, settled
    pub padding: [u8; 8],
    pub quote_position: I80F48, // native quote units, settled

    pub long_settled_funding: I80F48,
    pub short_settled_funding: I80F48,

    /// base lots locked up in resting orders
    pub bids_quantity: i64,
    pub asks_quantity: i64,

    /// matched as taker but not yet applied by the event consumer
    pub taker_base: i64,
    pub taker_quote: i64,
}

impl PerpPosition {
    pub fn add_taker_trade(&mut self, base_change: i64, quote_change: i64) {
        self.taker_base += base_change;
        self.taker_quote += quote_change;
    }

    pub fn remove_taker_trade(&mut self, base_change: i64, quote_change: i64) {
        self.taker_base -= base_change;
        self.taker_quote -= quote_change;
    }

    /// Funding accrued between the market's accumulators and this position's
    /// settled markers is charged against the quote position.
    pub fn settle_funding(&mut self, market: &PerpMarket) {
        match self.base_position.cmp(&0) {
            Ordering::Greater => {
                self.quote_position -= (market.long_funding - self.long_settled_funding)
                    * I80F48::from_num(self.base_position);
            }
            Ordering::Less => {
                self.quote_position -= (market.short_funding - self.short_settled_funding)
                    * I80F48::from_num(self.base_position);
            }
            Ordering::Equal => (),
        }
        self.long_settled_funding = market.long_funding;
        self.short_settled_funding = market.short_funding;
    }

    fn change_base_position(&mut self, market: &mut PerpMarket, base_change: i64) {
        let start = self.base_position;
        self.base_position += base_change;
        market.open_interest += self.base_position.abs() - start.abs();
    }
}

/// The margin account referenced by resting orders and fill events. Banks,
/// collateral and health live outside this program; this only tracks what
/// the order book needs: open order slots and the perp position.
#[derive(Copy, Clone, Pod, Loadable)]
#[repr(C)]
pub struct MarginAccount {
    pub meta_data: MetaData,

    pub perp_market: Pubkey,
    pub owner: Pubkey,
    pub padding: [u8; 8],

    pub perp_position: PerpPosition,

    pub orders: [u128; MAX_OPEN_ORDERS],
    pub client_order_ids: [u64; MAX_OPEN_ORDERS],
    pub order_side_and_tree: [SideAndOrderTree; MAX_OPEN_ORDERS],
}

impl MarginAccount {
    pub fn load_mut_checked<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
        perp_market_pk: &Pubkey,
    ) -> MeridianResult<RefMut<'a, Self>> {
        check_eq!(account.owner, program_id, MeridianErrorCode::InvalidOwner)?;
        let state = Self::load_mut(account)?;
        check_eq!(
            state.meta_data.data_type,
            DataType::MarginAccount as u8,
            MeridianErrorCode::InvalidAccountState
        )?;
        check!(state.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;
        check_eq!(&state.perp_market, perp_market_pk, MeridianErrorCode::InvalidMarket)?;
        Ok(state)
    }

    pub fn load_and_init<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
        perp_market_pk: &Pubkey,
        owner_ai: &'a AccountInfo,
        rent: &Rent,
    ) -> MeridianResult<RefMut<'a, Self>> {
        check!(
            rent.is_exempt(account.lamports(), account.data_len()),
            MeridianErrorCode::AccountNotRentExempt
        )?;
        check_eq!(account.owner, program_id, MeridianErrorCode::InvalidOwner)?;
        check!(owner_ai.is_signer, MeridianErrorCode::SignerNecessary)?;

        let mut state = Self::load_mut(account)?;
        check!(!state.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;
        state.meta_data = MetaData::new(DataType::MarginAccount, 0, true);
        state.perp_market = *perp_market_pk;
        state.owner = *owner_ai.key;

        Ok(state)
    }

    pub fn next_order_slot(&self) -> Option<usize> {
        self.orders.iter().position(|&id| id == FREE_ORDER_SLOT)
    }

    pub fn add_order(
        &mut self,
        side: Side,
        order_tree: BookSideOrderTree,
        order: &LeafNode,
    ) -> MeridianResult<()> {
        let slot = order.owner_slot as usize;
        check_eq!(self.orders[slot], FREE_ORDER_SLOT, MeridianErrorCode::Default)?;
        self.orders[slot] = order.key;
        self.client_order_ids[slot] = order.client_order_id;
        self.order_side_and_tree[slot] = SideAndOrderTree::new(side, order_tree);
        match side {
            Side::Bid => self.perp_position.bids_quantity += order.quantity,
            Side::Ask => self.perp_position.asks_quantity += order.quantity,
        }
        Ok(())
    }

    /// Free the slot and release `quantity` base lots from the locked totals.
    pub fn remove_order(&mut self, slot: usize, quantity: i64) -> MeridianResult<()> {
        check!(slot < MAX_OPEN_ORDERS, MeridianErrorCode::Default)?;
        check!(self.orders[slot] != FREE_ORDER_SLOT, MeridianErrorCode::Default)?;

        match self.order_side_and_tree[slot].side() {
            Side::Bid => self.perp_position.bids_quantity -= quantity,
            Side::Ask => self.perp_position.asks_quantity -= quantity,
        }
        self.orders[slot] = FREE_ORDER_SLOT;
        self.client_order_ids[slot] = 0;
        Ok(())
    }

    pub fn find_order_with_client_id(
        &self,
        client_order_id: u64,
    ) -> Option<(u128, SideAndOrderTree)> {
        for i in 0..MAX_OPEN_ORDERS {
            if self.orders[i] != FREE_ORDER_SLOT && self.client_order_ids[i] == client_order_id {
                return Some((self.orders[i], self.order_side_and_tree[i]));
            }
        }
        None
    }

    pub fn find_order_side_and_tree(&self, order_id: u128) -> Option<SideAndOrderTree> {
        for i in 0..MAX_OPEN_ORDERS {
            if self.orders[i] == order_id {
                return Some(self.order_side_and_tree[i]);
            }
        }
        None
    }

    /// Apply the maker half of a fill that was drained from the event queue.
    pub fn execute_maker(
        &mut self,
        market: &mut PerpMarket,
        fill: &FillEvent,
    ) -> MeridianResult<()> {
        let side = fill.taker_side.invert_side();
        let (base_change, quote_change) = fill.base_quote_change(side);
        let quote_native = I80F48::from_num(
            market
                .quote_lot_size
                .checked_mul(quote_change)
                .ok_or(math_err!())?,
        );
        let fees = quote_native.abs() * I80F48::from_num(fill.maker_fee);

        self.perp_position.settle_funding(market);
        self.perp_position.change_base_position(market, base_change);
        self.perp_position.quote_position += quote_native - fees;
        market.fees_accrued += fees;

        if fill.maker_out {
            self.remove_order(fill.maker_slot as usize, base_change.abs())
        } else {
            match side {
                Side::Bid => self.perp_position.bids_quantity -= base_change.abs(),
                Side::Ask => self.perp_position.asks_quantity -= base_change.abs(),
            }
            Ok(())
        }
    }

    /// Apply the taker half of a fill: move the pending taker amounts into
    /// the settled position and charge taker fees.
    pub fn execute_taker(
        &mut self,
        market: &mut PerpMarket,
        fill: &FillEvent,
    ) -> MeridianResult<()> {
        let (base_change, quote_change) = fill.base_quote_change(fill.taker_side);
        let quote_native = I80F48::from_num(
            market
                .quote_lot_size
                .checked_mul(quote_change)
                .ok_or(math_err!())?,
        );
        let fees = quote_native.abs() * I80F48::from_num(fill.taker_fee);

        self.perp_position.remove_taker_trade(base_change, quote_change);
        self.perp_position.settle_funding(market);
        self.perp_position.change_base_position(market, base_change);
        self.perp_position.quote_position += quote_native - fees;
        market.fees_accrued += fees;

        Ok(())
    }

    /// Apply an out event: the order is gone from the book, release its
    /// remaining quantity.
    pub fn execute_out(&mut self, out: &OutEvent) -> MeridianResult<()> {
        self.remove_order(out.slot as usize, out.quantity)
    }
}
