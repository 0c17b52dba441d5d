use bytemuck::cast;
use meridian_common::Loadable;
use meridian_macro::{Loadable, Pod};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use solana_program::account_info::AccountInfo;
use solana_program::msg;
use solana_program::pubkey::Pubkey;
use solana_program::rent::Rent;
use static_assertions::const_assert_eq;
use std::cell::RefMut;
use std::convert::TryFrom;
use std::mem::size_of;

use crate::critbit::{LeafNode, NodeHandle, OrderTreeNodes, OrderTreeRoot, OrderTreeType};
use crate::error::{check_assert, MeridianErrorCode, MeridianResult, SourceFileId};
use crate::queue::{EventQueue, FillEvent, OutEvent};
use crate::state::{DataType, MarginAccount, MetaData, PerpMarket, MAX_OPEN_ORDERS};

declare_check_assert_macros!(SourceFileId::Matching);

/// Drop at most this many expired orders from a BookSide when trying to match
/// orders. This exists as a guard against excessive compute use.
pub const DROP_EXPIRED_ORDER_LIMIT: usize = 5;

#[derive(
    Eq, PartialEq, Copy, Clone, TryFromPrimitive, IntoPrimitive, Debug, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Side {
    Bid = 0,
    Ask = 1,
}

impl Side {
    pub fn invert_side(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    /// Is `price` a better order execution than `compare_to` for this side?
    pub fn is_price_better(self, price: i64, compare_to: i64) -> bool {
        match self {
            Side::Bid => price > compare_to,
            Side::Ask => price < compare_to,
        }
    }

    /// Can an order on this side with limit `price_limit` match a resting
    /// counter-order at `counter_price`?
    pub fn is_price_within_limit(self, counter_price: i64, price_limit: i64) -> bool {
        match self {
            Side::Bid => counter_price <= price_limit,
            Side::Ask => counter_price >= price_limit,
        }
    }
}

/// The order type a resting order was placed with.
#[derive(
    Eq, PartialEq, Copy, Clone, TryFromPrimitive, IntoPrimitive, Debug, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PostOrderType {
    Limit = 0,
    PostOnly = 2,
    PostOnlySlide = 4,
}

/// The order type of an incoming order request.
#[derive(
    Eq, PartialEq, Copy, Clone, TryFromPrimitive, IntoPrimitive, Debug, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PlaceOrderType {
    Limit = 0,
    ImmediateOrCancel = 1,
    PostOnly = 2,
    Market = 3,
    PostOnlySlide = 4,
}

#[derive(
    Eq, PartialEq, Copy, Clone, TryFromPrimitive, IntoPrimitive, Debug, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum SelfTradeBehavior {
    /// Both the maker and taker sides of the matched orders are decremented.
    /// The fill is recorded with zeroed fee rates.
    DecrementTake = 0,
    /// Cancels the maker side of the trade, the taker side gets matched with
    /// other maker orders.
    CancelProvide = 1,
    /// Cancels the whole transaction as soon as a self-matching scenario is
    /// encountered.
    AbortTransaction = 2,
}

impl Default for SelfTradeBehavior {
    fn default() -> Self {
        SelfTradeBehavior::DecrementTake
    }
}

/// The two order trees of a BookSide.
#[derive(Eq, PartialEq, Copy, Clone, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BookSideOrderTree {
    Fixed = 0,
    OraclePegged = 1,
}

/// Side and tree combined, as stored in the margin account's order slots.
#[derive(Eq, PartialEq, Copy, Clone, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SideAndOrderTree {
    BidFixed = 0,
    AskFixed = 1,
    BidOraclePegged = 2,
    AskOraclePegged = 3,
}

impl SideAndOrderTree {
    pub fn new(side: Side, order_tree: BookSideOrderTree) -> Self {
        match (side, order_tree) {
            (Side::Bid, BookSideOrderTree::Fixed) => Self::BidFixed,
            (Side::Ask, BookSideOrderTree::Fixed) => Self::AskFixed,
            (Side::Bid, BookSideOrderTree::OraclePegged) => Self::BidOraclePegged,
            (Side::Ask, BookSideOrderTree::OraclePegged) => Self::AskOraclePegged,
        }
    }

    pub fn side(self) -> Side {
        match self {
            Self::BidFixed | Self::BidOraclePegged => Side::Bid,
            Self::AskFixed | Self::AskOraclePegged => Side::Ask,
        }
    }

    pub fn order_tree(self) -> BookSideOrderTree {
        match self {
            Self::BidFixed | Self::AskFixed => BookSideOrderTree::Fixed,
            Self::BidOraclePegged | Self::AskOraclePegged => BookSideOrderTree::OraclePegged,
        }
    }
}

const LOWER_ORDER_ID_MASK: u128 = 0xFFFF_FFFF_FFFF_FFFF;

pub fn fixed_price_data(price_lots: i64) -> MeridianResult<u64> {
    check!(price_lots >= 1, MeridianErrorCode::InvalidParam)?;
    Ok(price_lots as u64)
}

pub fn fixed_price_lots(price_data: u64) -> i64 {
    assert!(price_data <= i64::MAX as u64);
    price_data as i64
}

/// Oracle offsets are biased by i64::MIN so that ascending price data order
/// matches ascending offset order inside the pegged tree.
pub fn oracle_pegged_price_data(price_offset_lots: i64) -> u64 {
    (price_offset_lots as i128 - i64::MIN as i128) as u64
}

pub fn oracle_pegged_price_offset(price_data: u64) -> i64 {
    (price_data as i128 + i64::MIN as i128) as i64
}

/// The binary tree key an order would have if its price data were `price_lots`;
/// used to merge both trees of a book side at read time.
fn key_for_price(key: u128, price_lots: i64) -> u128 {
    let upper = (price_lots as u128) << 64;
    upper | (key & LOWER_ORDER_ID_MASK)
}

/// Effective price of an oracle pegged order given the current reference
/// price. When the effective price crosses the order's peg limit, the order
/// is not executable and the clipped limit price is reported instead.
pub fn oracle_pegged_price(
    oracle_price_lots: i64,
    node: &LeafNode,
    side: Side,
) -> (OrderState, i64) {
    let price_offset = oracle_pegged_price_offset(node.price_data());
    let price = oracle_price_lots.saturating_add(price_offset).max(1);
    if node.peg_limit != -1 && side.is_price_better(price, node.peg_limit) {
        (OrderState::Invalid, node.peg_limit)
    } else {
        (OrderState::Valid, price)
    }
}

#[derive(Clone, Debug)]
pub struct Order {
    pub side: Side,

    /// Max base lots to buy/sell.
    pub max_base_quantity: i64,

    /// Max quote lots to pay/receive (not taking fees into account).
    pub max_quote_quantity: i64,

    /// Arbitrary user-controlled order id.
    pub client_order_id: u64,

    /// Number of seconds the order shall live, 0 meaning forever
    pub time_in_force: u16,

    /// Configure how matches with order of the same owner are handled
    pub self_trade_behavior: SelfTradeBehavior,

    /// Order type specific params
    pub params: OrderParams,
}

#[derive(Clone, Debug)]
pub enum OrderParams {
    Market,
    ImmediateOrCancel {
        price_lots: i64,
    },
    Fixed {
        price_lots: i64,
        order_type: PostOrderType,
    },
    OraclePegged {
        price_offset_lots: i64,
        order_type: PostOrderType,
        peg_limit: i64,
    },
}

impl Order {
    /// Is this order required to be posted to the book? It will fail if it
    /// would take.
    pub fn is_post_only(&self) -> bool {
        let order_type = match self.params {
            OrderParams::Fixed { order_type, .. } => order_type,
            OrderParams::OraclePegged { order_type, .. } => order_type,
            _ => return false,
        };
        order_type == PostOrderType::PostOnly || order_type == PostOrderType::PostOnlySlide
    }

    /// Order tree that this order should be added to
    pub fn post_target(&self) -> Option<BookSideOrderTree> {
        match self.params {
            OrderParams::Fixed { .. } => Some(BookSideOrderTree::Fixed),
            OrderParams::OraclePegged { .. } => Some(BookSideOrderTree::OraclePegged),
            _ => None,
        }
    }

    pub fn post_order_type(&self) -> PostOrderType {
        match self.params {
            OrderParams::Fixed { order_type, .. } => order_type,
            OrderParams::OraclePegged { order_type, .. } => order_type,
            _ => PostOrderType::Limit,
        }
    }

    /// Only valid for orders with a peg_limit
    pub fn peg_limit(&self) -> i64 {
        match self.params {
            OrderParams::OraclePegged { peg_limit, .. } => peg_limit,
            _ => -1,
        }
    }

    /// Compute the price_lots this order is matched at and the price data
    /// that enters the order key if it is posted.
    pub fn price(
        &self,
        now_ts: u64,
        oracle_price_lots: i64,
        book: &Book,
    ) -> MeridianResult<(i64, u64)> {
        let price_lots = match self.params {
            OrderParams::Market => match self.side {
                Side::Bid => i64::MAX,
                Side::Ask => 1,
            },
            OrderParams::ImmediateOrCancel { price_lots } => price_lots,
            OrderParams::Fixed {
                price_lots,
                order_type,
            } => match order_type {
                PostOrderType::PostOnlySlide => {
                    if let Some(best_other_price) =
                        book.best_price(self.side.invert_side(), now_ts, oracle_price_lots)
                    {
                        post_only_slide_price_limit(self.side, price_lots, best_other_price)
                    } else {
                        price_lots
                    }
                }
                _ => price_lots,
            },
            OrderParams::OraclePegged {
                price_offset_lots,
                order_type,
                ..
            } => {
                let price_lots = oracle_price_lots
                    .checked_add(price_offset_lots)
                    .ok_or(math_err!())?;
                match order_type {
                    PostOrderType::PostOnlySlide => {
                        if let Some(best_other_price) =
                            book.best_price(self.side.invert_side(), now_ts, oracle_price_lots)
                        {
                            post_only_slide_price_limit(self.side, price_lots, best_other_price)
                        } else {
                            price_lots
                        }
                    }
                    _ => price_lots,
                }
            }
        };
        check!(price_lots >= 1, MeridianErrorCode::InvalidParam)?;

        let price_data = match self.params {
            OrderParams::OraclePegged { .. } => {
                oracle_pegged_price_data(price_lots - oracle_price_lots)
            }
            _ => fixed_price_data(price_lots)?,
        };
        Ok((price_lots, price_data))
    }
}

/// The price the order would need to have to not cross the opposite best.
fn post_only_slide_price_limit(side: Side, price_lots: i64, best_other_price: i64) -> i64 {
    match side {
        Side::Bid => price_lots.min(best_other_price - 1),
        Side::Ask => price_lots.max(best_other_price + 1),
    }
}

/// Reference to an order in a specific tree of a book side.
#[derive(Clone, Copy, Debug)]
pub struct BookSideOrderHandle {
    pub node: NodeHandle,
    pub order_tree: BookSideOrderTree,
}

/// One side of the order book: a fixed price tree and an oracle pegged tree
/// sharing one node arena, merged into a single price-ordered view at read
/// time. Pegged orders cannot share the fixed tree's key space because their
/// effective price changes with every reference price read.
#[derive(Copy, Clone, Pod, Loadable)]
#[repr(C)]
pub struct BookSide {
    pub meta_data: MetaData,

    pub roots: [OrderTreeRoot; 2],
    pub reserved_roots: [OrderTreeRoot; 4],
    pub reserved: [u8; 8],
    pub nodes: OrderTreeNodes,
}
const_assert_eq!(size_of::<BookSide>() % 16, 0);

impl BookSide {
    pub fn load_mut_checked<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
        perp_market: &PerpMarket,
    ) -> MeridianResult<RefMut<'a, Self>> {
        check!(account.owner == program_id, MeridianErrorCode::InvalidOwner)?;
        let state = Self::load_mut(account)?;
        check!(state.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;

        match DataType::try_from(state.meta_data.data_type).map_err(|_| throw!())? {
            DataType::Bids => {
                check!(account.key == &perp_market.bids, MeridianErrorCode::InvalidAccount)?
            }
            DataType::Asks => {
                check!(account.key == &perp_market.asks, MeridianErrorCode::InvalidAccount)?
            }
            _ => return Err(throw!()),
        }

        Ok(state)
    }

    pub fn load_and_init<'a>(
        account: &'a AccountInfo,
        program_id: &Pubkey,
        data_type: DataType,
        rent: &Rent,
    ) -> MeridianResult<RefMut<'a, Self>> {
        // NOTE: check this first so we can borrow account later
        check!(
            rent.is_exempt(account.lamports(), account.data_len()),
            MeridianErrorCode::AccountNotRentExempt
        )?;
        check!(account.owner == program_id, MeridianErrorCode::InvalidOwner)?;

        let mut state = Self::load_mut(account)?;
        check!(!state.meta_data.is_initialized, MeridianErrorCode::InvalidAccountState)?;
        state.meta_data = MetaData::new(data_type, 0, true);
        state.nodes.order_tree_type = match data_type {
            DataType::Bids => OrderTreeType::Bids,
            DataType::Asks => OrderTreeType::Asks,
            _ => return Err(throw!()),
        }
        .into();
        Ok(state)
    }

    pub fn side(&self) -> Side {
        match self.nodes.order_tree_type() {
            OrderTreeType::Bids => Side::Bid,
            OrderTreeType::Asks => Side::Ask,
        }
    }

    pub fn root(&self, component: BookSideOrderTree) -> &OrderTreeRoot {
        &self.roots[component as usize]
    }

    pub fn is_full(&self) -> bool {
        self.nodes.is_full()
    }

    pub fn insert_leaf(
        &mut self,
        component: BookSideOrderTree,
        new_leaf: &LeafNode,
    ) -> MeridianResult<(NodeHandle, Option<LeafNode>)> {
        let root = &mut self.roots[component as usize];
        self.nodes.insert_leaf(root, new_leaf)
    }

    pub fn remove_by_key(&mut self, component: BookSideOrderTree, key: u128) -> Option<LeafNode> {
        let root = &mut self.roots[component as usize];
        self.nodes.remove_by_key(root, key)
    }

    pub fn remove_one_expired(
        &mut self,
        component: BookSideOrderTree,
        now_ts: u64,
    ) -> Option<LeafNode> {
        let root = &mut self.roots[component as usize];
        self.nodes.remove_one_expired(root, now_ts)
    }

    /// Iterate over all orders of both trees in price-time priority order,
    /// including expired and peg-limited ones.
    pub fn iter_all_including_invalid(
        &self,
        now_ts: u64,
        oracle_price_lots: i64,
    ) -> BookSideIter {
        BookSideIter::new(self, now_ts, oracle_price_lots)
    }

    pub fn iter_valid<'a>(
        &'a self,
        now_ts: u64,
        oracle_price_lots: i64,
    ) -> impl Iterator<Item = BookSideIterItem<'a>> {
        BookSideIter::new(self, now_ts, oracle_price_lots).filter(|it| it.state == OrderState::Valid)
    }

    /// The best executable price on this side, merging both trees.
    pub fn best_price(&self, now_ts: u64, oracle_price_lots: i64) -> Option<i64> {
        Some(
            self.iter_valid(now_ts, oracle_price_lots)
                .next()?
                .price_lots,
        )
    }

    /// The last order in priority: (tree, key, effective price). Peg-limited
    /// orders compare at their clipped limit price.
    pub fn worst_order(&self, oracle_price_lots: i64) -> Option<(BookSideOrderTree, u128, i64)> {
        let side = self.side();
        let worst_fixed = self.nodes.worst_leaf(&self.roots[0]);
        let worst_pegged = self.nodes.worst_leaf(&self.roots[1]);
        match (worst_fixed, worst_pegged) {
            (Some((_, f)), Some((_, p))) => {
                let fixed_price = fixed_price_lots(f.price_data());
                let pegged_price = oracle_pegged_price(oracle_price_lots, p, side).1;
                if side.is_price_better(fixed_price, pegged_price) {
                    Some((BookSideOrderTree::OraclePegged, p.key, pegged_price))
                } else {
                    Some((BookSideOrderTree::Fixed, f.key, fixed_price))
                }
            }
            (Some((_, f)), None) => Some((
                BookSideOrderTree::Fixed,
                f.key,
                fixed_price_lots(f.price_data()),
            )),
            (None, Some((_, p))) => Some((
                BookSideOrderTree::OraclePegged,
                p.key,
                oracle_pegged_price(oracle_price_lots, p, side).1,
            )),
            (None, None) => None,
        }
    }

    pub fn remove_worst(&mut self, oracle_price_lots: i64) -> Option<(LeafNode, i64)> {
        let (component, key, price) = self.worst_order(oracle_price_lots)?;
        let leaf = self.remove_by_key(component, key)?;
        Some((leaf, price))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderState {
    Valid,
    Invalid,
}

pub struct BookSideIterItem<'a> {
    pub handle: BookSideOrderHandle,
    pub node: &'a LeafNode,
    pub price_lots: i64,
    pub state: OrderState,
}

impl<'a> BookSideIterItem<'a> {
    pub fn is_valid(&self) -> bool {
        self.state == OrderState::Valid
    }
}

/// Iterates the fixed and oracle pegged trees of one book side as a single
/// sequence ordered by (effective price, priority).
pub struct BookSideIter<'a> {
    fixed_iter: crate::critbit::OrderTreeIter<'a>,
    oracle_pegged_iter: crate::critbit::OrderTreeIter<'a>,
    side: Side,
    now_ts: u64,
    oracle_price_lots: i64,
}

impl<'a> BookSideIter<'a> {
    pub fn new(book_side: &'a BookSide, now_ts: u64, oracle_price_lots: i64) -> Self {
        Self {
            fixed_iter: book_side
                .nodes
                .iter(&book_side.roots[BookSideOrderTree::Fixed as usize]),
            oracle_pegged_iter: book_side
                .nodes
                .iter(&book_side.roots[BookSideOrderTree::OraclePegged as usize]),
            side: book_side.side(),
            now_ts,
            oracle_price_lots,
        }
    }

    fn fixed_item(&self, item: (NodeHandle, &'a LeafNode)) -> BookSideIterItem<'a> {
        let (handle, node) = item;
        let state = if node.is_expired(self.now_ts) {
            OrderState::Invalid
        } else {
            OrderState::Valid
        };
        BookSideIterItem {
            handle: BookSideOrderHandle {
                node: handle,
                order_tree: BookSideOrderTree::Fixed,
            },
            node,
            price_lots: fixed_price_lots(node.price_data()),
            state,
        }
    }

    fn pegged_item(
        &self,
        item: (NodeHandle, &'a LeafNode),
        state: OrderState,
        price_lots: i64,
    ) -> BookSideIterItem<'a> {
        let (handle, node) = item;
        let state = if node.is_expired(self.now_ts) {
            OrderState::Invalid
        } else {
            state
        };
        BookSideIterItem {
            handle: BookSideOrderHandle {
                node: handle,
                order_tree: BookSideOrderTree::OraclePegged,
            },
            node,
            price_lots,
            state,
        }
    }
}

impl<'a> Iterator for BookSideIter<'a> {
    type Item = BookSideIterItem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let is_better: fn(u128, u128) -> bool = if self.side == Side::Bid {
            |a, b| a > b
        } else {
            |a, b| a < b
        };

        match (self.fixed_iter.peek(), self.oracle_pegged_iter.peek()) {
            (Some(f), Some(o)) => {
                let (o_state, o_price) = oracle_pegged_price(self.oracle_price_lots, o.1, self.side);
                if is_better(f.1.key, key_for_price(o.1.key, o_price)) {
                    self.fixed_iter.next();
                    Some(self.fixed_item(f))
                } else {
                    self.oracle_pegged_iter.next();
                    Some(self.pegged_item(o, o_state, o_price))
                }
            }
            (None, Some(o)) => {
                let (o_state, o_price) = oracle_pegged_price(self.oracle_price_lots, o.1, self.side);
                self.oracle_pegged_iter.next();
                Some(self.pegged_item(o, o_state, o_price))
            }
            (Some(f), None) => {
                self.fixed_iter.next();
                Some(self.fixed_item(f))
            }
            (None, None) => None,
        }
    }
}

/// What happened to an incoming order.
#[derive(Debug, Default)]
pub struct OrderSummary {
    pub total_base_taken: i64,
    pub total_quote_taken: i64,
    pub posted_order_id: Option<u128>,
    /// Remainder that should have rested on the book but could not, because
    /// the arena was full of better orders or the account had no free order
    /// slot. Fills that happened before are kept.
    pub not_posted_quantity: i64,
}

pub struct Book<'a> {
    pub bids: RefMut<'a, BookSide>,
    pub asks: RefMut<'a, BookSide>,
}

impl<'a> Book<'a> {
    pub fn load_checked(
        program_id: &Pubkey,
        bids_ai: &'a AccountInfo,
        asks_ai: &'a AccountInfo,
        perp_market: &PerpMarket,
    ) -> MeridianResult<Self> {
        Ok(Self {
            bids: BookSide::load_mut_checked(bids_ai, program_id, perp_market)?,
            asks: BookSide::load_mut_checked(asks_ai, program_id, perp_market)?,
        })
    }

    pub fn bookside(&self, side: Side) -> &BookSide {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    pub fn bookside_mut(&mut self, side: Side) -> &mut BookSide {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    pub fn best_price(&self, side: Side, now_ts: u64, oracle_price_lots: i64) -> Option<i64> {
        self.bookside(side).best_price(now_ts, oracle_price_lots)
    }

    /// Walk the valid orders of one side until `quantity` base lots are
    /// accumulated and return the price level that was reached.
    pub fn get_impact_price(
        &self,
        side: Side,
        quantity: i64,
        now_ts: u64,
        oracle_price_lots: i64,
    ) -> Option<i64> {
        let mut sum: i64 = 0;
        for order in self.bookside(side).iter_valid(now_ts, oracle_price_lots) {
            sum += order.node.quantity;
            if sum >= quantity {
                return Some(order.price_lots);
            }
        }
        None
    }

    /// Match an incoming order against the book per its order type, then post
    /// any remainder.
    ///
    /// A rejection (post-only crossing, abort self-trade, full event queue)
    /// leaves book, accounts and event queue untouched.
    #[allow(clippy::too_many_arguments)]
    #[inline(never)]
    pub fn new_order(
        &mut self,
        order: &Order,
        market: &mut PerpMarket,
        event_queue: &mut EventQueue,
        oracle_price_lots: i64,
        margin_account: &mut MarginAccount,
        margin_account_pk: &Pubkey,
        now_ts: u64,
        limit: u8,
    ) -> MeridianResult<OrderSummary> {
        let initial_event_count = event_queue.len();
        let result = self.new_order_inner(
            order,
            market,
            event_queue,
            oracle_price_lots,
            margin_account,
            margin_account_pk,
            now_ts,
            limit,
        );
        if result.is_err() {
            // an unemittable fill must not leave earlier effects behind
            event_queue.revert_pushes(initial_event_count)?;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn new_order_inner(
        &mut self,
        order: &Order,
        market: &mut PerpMarket,
        event_queue: &mut EventQueue,
        oracle_price_lots: i64,
        margin_account: &mut MarginAccount,
        margin_account_pk: &Pubkey,
        now_ts: u64,
        limit: u8,
    ) -> MeridianResult<OrderSummary> {
        let side = order.side;
        let other_side = side.invert_side();
        let post_only = order.is_post_only();
        let mut post_target = order.post_target();

        check!(order.max_base_quantity > 0, MeridianErrorCode::InvalidParam)?;
        check!(order.max_quote_quantity > 0, MeridianErrorCode::InvalidParam)?;

        let (price_lots, price_data) = order.price(now_ts, oracle_price_lots, self)?;
        let order_id = market.gen_order_id(side, price_data);

        // Iterate through book and match against this new order.
        //
        // Any changes to matching orders on the other side of the book are
        // collected in orders_to_change/orders_to_delete and applied after
        // the loop.
        let mut remaining_base_quantity = order.max_base_quantity;
        let mut remaining_quote_quantity = order.max_quote_quantity;
        let mut orders_to_change: Vec<(NodeHandle, i64)> = vec![];
        let mut orders_to_delete: Vec<(BookSideOrderTree, u128)> = vec![];
        let mut number_of_dropped_expired_orders = 0;
        let mut remaining_limit = limit;
        let opposing_bookside = self.bookside_mut(other_side);
        for best_opposing in opposing_bookside.iter_all_including_invalid(now_ts, oracle_price_lots)
        {
            if remaining_base_quantity == 0 || remaining_quote_quantity == 0 {
                break;
            }

            if !best_opposing.is_valid() {
                // Remove the order from the book unless we've done that enough.
                // Peg-limited orders stay resting, inert, until the reference
                // price moves back or they expire.
                if number_of_dropped_expired_orders < DROP_EXPIRED_ORDER_LIMIT
                    && best_opposing.node.is_expired(now_ts)
                {
                    number_of_dropped_expired_orders += 1;
                    let event = OutEvent::new(
                        other_side,
                        best_opposing.node.owner_slot,
                        now_ts,
                        event_queue.header.seq_num,
                        best_opposing.node.owner,
                        best_opposing.node.quantity,
                        best_opposing.node.key,
                    );
                    event_queue
                        .push_back(cast(event))
                        .map_err(|_| throw_err!(MeridianErrorCode::EventQueueFull))?;
                    orders_to_delete
                        .push((best_opposing.handle.order_tree, best_opposing.node.key));
                }
                continue;
            }

            let best_opposing_price = best_opposing.price_lots;

            if !side.is_price_within_limit(best_opposing_price, price_lots) {
                break;
            } else if post_only {
                msg!("Order could not be placed due to PostOnly");
                return Err(throw_err!(MeridianErrorCode::PostOnlyViolation));
            } else if remaining_limit == 0 {
                msg!("Order matching limit reached");
                post_target = None;
                break;
            }

            let max_match_by_quote = remaining_quote_quantity / best_opposing_price;
            if max_match_by_quote == 0 {
                break;
            }

            let match_quantity = remaining_base_quantity
                .min(best_opposing.node.quantity)
                .min(max_match_by_quote);
            let match_quote = match_quantity * best_opposing_price;

            let order_would_self_trade = *margin_account_pk == best_opposing.node.owner;
            if order_would_self_trade {
                match order.self_trade_behavior {
                    SelfTradeBehavior::DecrementTake => (),
                    SelfTradeBehavior::CancelProvide => {
                        let event = OutEvent::new(
                            other_side,
                            best_opposing.node.owner_slot,
                            now_ts,
                            event_queue.header.seq_num,
                            best_opposing.node.owner,
                            best_opposing.node.quantity,
                            best_opposing.node.key,
                        );
                        event_queue
                            .push_back(cast(event))
                            .map_err(|_| throw_err!(MeridianErrorCode::EventQueueFull))?;
                        orders_to_delete
                            .push((best_opposing.handle.order_tree, best_opposing.node.key));

                        // skip actual matching
                        continue;
                    }
                    SelfTradeBehavior::AbortTransaction => {
                        return Err(throw_err!(MeridianErrorCode::WouldSelfTrade))
                    }
                }
            }

            remaining_base_quantity -= match_quantity;
            remaining_quote_quantity -= match_quote;

            let new_best_opposing_quantity = best_opposing.node.quantity - match_quantity;
            let maker_out = new_best_opposing_quantity == 0;
            if maker_out {
                orders_to_delete.push((best_opposing.handle.order_tree, best_opposing.node.key));
            } else {
                orders_to_change.push((best_opposing.handle.node, new_best_opposing_quantity));
            }

            // self-trades in decrement mode don't get charged fees
            let (maker_fee, taker_fee) = if order_would_self_trade {
                (0.0, 0.0)
            } else {
                (
                    market.maker_fee.to_num::<f32>(),
                    market.taker_fee.to_num::<f32>(),
                )
            };

            let fill = FillEvent::new(
                side,
                maker_out,
                best_opposing.node.owner_slot,
                now_ts,
                event_queue.header.seq_num,
                best_opposing.node.owner,
                best_opposing.node.key,
                best_opposing.node.client_order_id,
                maker_fee,
                best_opposing.node.timestamp,
                *margin_account_pk,
                order_id,
                order.client_order_id,
                taker_fee,
                best_opposing_price,
                match_quantity,
            );
            event_queue
                .push_back(cast(fill))
                .map_err(|_| throw_err!(MeridianErrorCode::EventQueueFull))?;
            remaining_limit -= 1;
        }
        let total_base_taken = order.max_base_quantity - remaining_base_quantity;
        let total_quote_taken = order.max_quote_quantity - remaining_quote_quantity;

        // Record the taker change on the account; it is realized against the
        // position when the fill events are consumed.
        if total_base_taken > 0 {
            let (taker_base_change, taker_quote_change) = match side {
                Side::Bid => (total_base_taken, -total_quote_taken),
                Side::Ask => (-total_base_taken, total_quote_taken),
            };
            margin_account
                .perp_position
                .add_taker_trade(taker_base_change, taker_quote_change);
        }

        // Apply changes to matched orders (handles are invalidated by deletes!)
        for (handle, new_quantity) in orders_to_change {
            opposing_bookside
                .nodes
                .node_mut(handle)
                .unwrap()
                .as_leaf_mut()
                .unwrap()
                .quantity = new_quantity;
        }
        for (component, key) in orders_to_delete {
            let _removed_leaf = opposing_bookside.remove_by_key(component, key).unwrap();
        }

        //
        // Place the remainder on the book if requested
        //
        let book_base_quantity = remaining_base_quantity.min(remaining_quote_quantity / price_lots);
        if book_base_quantity <= 0 {
            post_target = None;
        }

        let mut posted_order_id = None;
        let mut not_posted_quantity = 0;
        if let Some(order_tree_target) = post_target {
            let bookside = self.bookside_mut(side);

            // Drop an expired order from the posting tree if possible. The
            // removal may only happen while the queue can take its event.
            if !event_queue.full() {
                if let Some(expired_order) = bookside.remove_one_expired(order_tree_target, now_ts)
                {
                    let event = OutEvent::new(
                        side,
                        expired_order.owner_slot,
                        now_ts,
                        event_queue.header.seq_num,
                        expired_order.owner,
                        expired_order.quantity,
                        expired_order.key,
                    );
                    event_queue.push_back(cast(event)).unwrap();
                }
            }

            if bookside.is_full() && !event_queue.full() {
                // If the new order beats the worst resting one, boot that out
                // and take its space
                match bookside.worst_order(oracle_price_lots) {
                    Some((_, _, worst_price)) if side.is_price_better(price_lots, worst_price) => {
                        let (worst_order, _) = bookside.remove_worst(oracle_price_lots).unwrap();
                        let event = OutEvent::new(
                            side,
                            worst_order.owner_slot,
                            now_ts,
                            event_queue.header.seq_num,
                            worst_order.owner,
                            worst_order.quantity,
                            worst_order.key,
                        );
                        event_queue.push_back(cast(event)).unwrap();
                    }
                    _ => (),
                }
            }

            if bookside.is_full() {
                // fills already happened and stay; the caller learns about
                // the remainder instead of the book silently swallowing it
                msg!("Book full, {} lots could not be posted", book_base_quantity);
                not_posted_quantity = book_base_quantity;
            } else {
                match margin_account.next_order_slot() {
                    None => {
                        msg!(
                            "Too many open orders, {} lots could not be posted",
                            book_base_quantity
                        );
                        not_posted_quantity = book_base_quantity;
                    }
                    Some(owner_slot) => {
                        let new_order_leaf = LeafNode::new(
                            owner_slot as u8,
                            order_id,
                            *margin_account_pk,
                            book_base_quantity,
                            now_ts,
                            order.post_order_type(),
                            order.time_in_force,
                            order.peg_limit(),
                            order.client_order_id,
                        );
                        let _result = bookside.insert_leaf(order_tree_target, &new_order_leaf)?;

                        msg!(
                            "{} on book order_id={} quantity={} price={}",
                            match side {
                                Side::Bid => "bid",
                                Side::Ask => "ask",
                            },
                            order_id,
                            book_base_quantity,
                            price_lots
                        );

                        margin_account.add_order(side, order_tree_target, &new_order_leaf)?;
                        posted_order_id = Some(order_id);
                    }
                }
            }
        }

        Ok(OrderSummary {
            total_base_taken,
            total_quote_taken,
            posted_order_id,
            not_posted_quantity,
        })
    }

    /// Cancel a resting order. This never touches the event queue: only
    /// counter-party fills produce settlement events.
    pub fn cancel_order(
        &mut self,
        margin_account: &mut MarginAccount,
        order_id: u128,
        side_and_tree: SideAndOrderTree,
        expected_owner: Option<Pubkey>,
    ) -> MeridianResult<LeafNode> {
        let side = side_and_tree.side();
        let book_component = side_and_tree.order_tree();
        let leaf_node = self
            .bookside_mut(side)
            .remove_by_key(book_component, order_id)
            .ok_or(throw_err!(MeridianErrorCode::InvalidOrderId))?;
        if let Some(owner) = expected_owner {
            check_eq!(leaf_node.owner, owner, MeridianErrorCode::InvalidOrderId)?;
        }
        margin_account.remove_order(leaf_node.owner_slot as usize, leaf_node.quantity)?;
        Ok(leaf_node)
    }

    /// Cancel up to `limit` orders the account has on this book.
    pub fn cancel_all_orders(
        &mut self,
        margin_account: &mut MarginAccount,
        margin_account_pk: &Pubkey,
        mut limit: u8,
    ) -> MeridianResult<()> {
        if limit == 0 {
            return Ok(());
        }
        for i in 0..MAX_OPEN_ORDERS {
            let order_id = margin_account.orders[i];
            if order_id == crate::state::FREE_ORDER_SLOT {
                continue;
            }
            let side_and_tree = margin_account.order_side_and_tree[i];

            match self.cancel_order(
                margin_account,
                order_id,
                side_and_tree,
                Some(*margin_account_pk),
            ) {
                Ok(_) => (),
                Err(_) => {
                    // If it's not on the book, it was already filled or
                    // expired and the event consumer will free the slot
                    msg!("Order {} not found on the book", order_id);
                }
            };

            limit -= 1;
            if limit == 0 {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{AnyEvent, EventQueueHeader, EventType};
    use bytemuck::{cast_ref, Zeroable};
    use fixed::types::I80F48;
    use std::cell::RefCell;

    struct OrderbookAccounts {
        bids: Box<RefCell<BookSide>>,
        asks: Box<RefCell<BookSide>>,
    }

    impl OrderbookAccounts {
        fn new() -> Self {
            let s = Self {
                bids: Box::new(RefCell::new(BookSide::zeroed())),
                asks: Box::new(RefCell::new(BookSide::zeroed())),
            };
            s.bids.borrow_mut().nodes.order_tree_type = OrderTreeType::Bids.into();
            s.bids.borrow_mut().meta_data = MetaData::new(DataType::Bids, 0, true);
            s.asks.borrow_mut().nodes.order_tree_type = OrderTreeType::Asks.into();
            s.asks.borrow_mut().meta_data = MetaData::new(DataType::Asks, 0, true);
            s
        }

        fn book(&self) -> Book {
            Book {
                bids: self.bids.borrow_mut(),
                asks: self.asks.borrow_mut(),
            }
        }
    }

    struct EventQueueAccount {
        header: RefCell<EventQueueHeader>,
        buf: RefCell<Vec<AnyEvent>>,
    }

    impl EventQueueAccount {
        fn new() -> Self {
            Self::with_capacity(512)
        }

        fn with_capacity(capacity: usize) -> Self {
            Self {
                header: RefCell::new(EventQueueHeader::zeroed()),
                buf: RefCell::new(vec![AnyEvent::zeroed(); capacity]),
            }
        }

        fn queue(&self) -> EventQueue {
            EventQueue::new(
                self.header.borrow_mut(),
                RefMut::map(self.buf.borrow_mut(), |b| b.as_mut_slice()),
            )
        }
    }

    fn test_market() -> PerpMarket {
        let mut market = PerpMarket::zeroed();
        market.base_lot_size = 1;
        market.quote_lot_size = 1;
        market
    }

    fn fixed_order(side: Side, price_lots: i64, max_base: i64) -> Order {
        Order {
            side,
            max_base_quantity: max_base,
            max_quote_quantity: i64::MAX,
            client_order_id: 0,
            time_in_force: 0,
            self_trade_behavior: SelfTradeBehavior::DecrementTake,
            params: OrderParams::Fixed {
                price_lots,
                order_type: PostOrderType::Limit,
            },
        }
    }

    const ORACLE_PRICE_LOTS: i64 = 5000;

    fn place(
        book: &mut Book,
        event_queue: &mut EventQueue,
        market: &mut PerpMarket,
        account: &mut MarginAccount,
        account_pk: &Pubkey,
        order: Order,
        now_ts: u64,
    ) -> OrderSummary {
        book.new_order(
            &order,
            market,
            event_queue,
            ORACLE_PRICE_LOTS,
            account,
            account_pk,
            now_ts,
            u8::MAX,
        )
        .unwrap()
    }

    fn fill_at(event_queue: &EventQueue, index: usize) -> FillEvent {
        let event = event_queue.iter().nth(index).unwrap();
        assert_eq!(event.event_type, EventType::Fill as u8);
        *cast_ref::<AnyEvent, FillEvent>(event)
    }

    fn out_at(event_queue: &EventQueue, index: usize) -> OutEvent {
        let event = event_queue.iter().nth(index).unwrap();
        assert_eq!(event.event_type, EventType::Out as u8);
        *cast_ref::<AnyEvent, OutEvent>(event)
    }

    // Two bids at the same price fill oldest-first; the second is only
    // partially consumed and stays resting.
    #[test]
    fn price_time_priority() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_a_pk = Pubkey::new_unique();
        let maker_b_pk = Pubkey::new_unique();
        let taker_pk = Pubkey::new_unique();
        let mut maker_a = MarginAccount::zeroed();
        let mut maker_b = MarginAccount::zeroed();
        let mut taker = MarginAccount::zeroed();

        let a = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker_a,
            &maker_a_pk,
            fixed_order(Side::Bid, 100, 5),
            0,
        );
        let b = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker_b,
            &maker_b_pk,
            fixed_order(Side::Bid, 100, 3),
            1,
        );
        assert!(a.posted_order_id.is_some());
        assert!(b.posted_order_id.is_some());
        assert_eq!(book.best_price(Side::Bid, 1, ORACLE_PRICE_LOTS), Some(100));

        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            fixed_order(Side::Ask, 100, 6),
            2,
        );
        assert_eq!(summary.total_base_taken, 6);
        assert_eq!(summary.total_quote_taken, 600);
        assert!(summary.posted_order_id.is_none());

        assert_eq!(event_queue.len(), 2);
        let first = fill_at(&event_queue, 0);
        assert_eq!(first.maker, maker_a_pk);
        assert_eq!(first.quantity, 5);
        assert!(first.maker_out);
        let second = fill_at(&event_queue, 1);
        assert_eq!(second.maker, maker_b_pk);
        assert_eq!(second.quantity, 1);
        assert!(!second.maker_out);

        // maker B's remainder still rests with 2 lots
        let root = *book.bids.root(BookSideOrderTree::Fixed);
        assert_eq!(root.leaf_count, 1);
        let (_, leaf) = book.bids.nodes.max_leaf(&root).unwrap();
        assert_eq!(leaf.owner, maker_b_pk);
        assert_eq!(leaf.quantity, 2);

        // conservation on the taker account
        assert_eq!(taker.perp_position.taker_base, -6);
        assert_eq!(taker.perp_position.taker_quote, 600);
    }

    // A post-only order that would cross is rejected without touching any state.
    #[test]
    fn post_only_rejected_when_crossing() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 99, 1),
            0,
        );

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let mut order = fixed_order(Side::Bid, 100, 1);
        order.params = OrderParams::Fixed {
            price_lots: 100,
            order_type: PostOrderType::PostOnly,
        };
        let err = book
            .new_order(
                &order,
                &mut market,
                &mut event_queue,
                ORACLE_PRICE_LOTS,
                &mut taker,
                &taker_pk,
                1,
                u8::MAX,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::MeridianError::MeridianErrorCode {
                meridian_error_code: MeridianErrorCode::PostOnlyViolation,
                ..
            }
        ));

        // no tree mutation, no event
        assert_eq!(event_queue.len(), 0);
        assert_eq!(book.bids.root(BookSideOrderTree::Fixed).leaf_count, 0);
        assert_eq!(book.asks.root(BookSideOrderTree::Fixed).leaf_count, 1);
        assert_eq!(taker.next_order_slot(), Some(0));
    }

    #[test]
    fn post_only_slide_reprices() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 100, 1),
            0,
        );

        let bidder_pk = Pubkey::new_unique();
        let mut bidder = MarginAccount::zeroed();
        let mut order = fixed_order(Side::Bid, 105, 1);
        order.params = OrderParams::Fixed {
            price_lots: 105,
            order_type: PostOrderType::PostOnlySlide,
        };
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut bidder,
            &bidder_pk,
            order,
            1,
        );
        assert!(summary.posted_order_id.is_some());
        assert_eq!(summary.total_base_taken, 0);
        assert_eq!(event_queue.len(), 0);
        assert_eq!(book.best_price(Side::Bid, 1, ORACLE_PRICE_LOTS), Some(99));
    }

    // IOC fills what it can and the rest evaporates with no out event.
    #[test]
    fn ioc_remainder_is_dropped() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 100, 5),
            0,
        );

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let mut order = fixed_order(Side::Bid, 100, 8);
        order.params = OrderParams::ImmediateOrCancel { price_lots: 100 };
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            order,
            1,
        );
        assert_eq!(summary.total_base_taken, 5);
        assert!(summary.posted_order_id.is_none());
        assert_eq!(summary.not_posted_quantity, 0);
        assert_eq!(event_queue.len(), 1);
        assert_eq!(book.bids.root(BookSideOrderTree::Fixed).leaf_count, 0);
    }

    // The quote limit bounds matching even when base quantity remains, and
    // never produces zero-quantity fills.
    #[test]
    fn max_quote_quantity_bounds_matching() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        for (i, price) in [5000, 5001, 5002].iter().enumerate() {
            place(
                &mut book,
                &mut event_queue,
                &mut market,
                &mut maker,
                &maker_pk,
                fixed_order(Side::Ask, *price, 5),
                i as u64,
            );
        }

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let mut order = fixed_order(Side::Bid, 5005, 30);
        order.max_quote_quantity = 6000;
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            order,
            3,
        );
        // 6000 quote lots buy exactly one lot at 5000; at 5001 not even one
        assert_eq!(summary.total_base_taken, 1);
        assert_eq!(event_queue.len(), 1);

        // a quote limit too small for a single lot produces no fill at all
        let mut order = fixed_order(Side::Bid, 5005, 30);
        order.max_quote_quantity = 1;
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            order,
            4,
        );
        assert_eq!(summary.total_base_taken, 0);
        assert_eq!(event_queue.len(), 1);
    }

    #[test]
    fn market_order_crosses_any_price() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 99999, 2),
            0,
        );

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let order = Order {
            side: Side::Bid,
            max_base_quantity: 2,
            max_quote_quantity: 1_000_000,
            client_order_id: 0,
            time_in_force: 0,
            self_trade_behavior: SelfTradeBehavior::DecrementTake,
            params: OrderParams::Market,
        };
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            order,
            1,
        );
        assert_eq!(summary.total_base_taken, 2);
        assert!(summary.posted_order_id.is_none());
        assert_eq!(fill_at(&event_queue, 0).price, 99999);
    }

    #[test]
    fn self_trade_decrement_take() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();
        market.taker_fee = I80F48::from_num(0.01);

        let owner_pk = Pubkey::new_unique();
        let other_pk = Pubkey::new_unique();
        let mut owner = MarginAccount::zeroed();
        let mut other = MarginAccount::zeroed();

        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut owner,
            &owner_pk,
            fixed_order(Side::Ask, 1000, 1),
            0,
        );
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut other,
            &other_pk,
            fixed_order(Side::Ask, 1000, 1),
            1,
        );

        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut owner,
            &owner_pk,
            fixed_order(Side::Bid, 1000, 2),
            2,
        );
        assert_eq!(summary.total_base_taken, 2);
        assert_eq!(event_queue.len(), 2);

        // the self-match is recorded fee-free, the real match is charged
        let self_fill = fill_at(&event_queue, 0);
        assert_eq!(self_fill.maker, owner_pk);
        assert_eq!(self_fill.taker, owner_pk);
        assert_eq!(self_fill.maker_fee, 0.0);
        assert_eq!(self_fill.taker_fee, 0.0);

        let real_fill = fill_at(&event_queue, 1);
        assert_eq!(real_fill.maker, other_pk);
        assert_eq!(real_fill.taker, owner_pk);
        assert_eq!(real_fill.taker_fee, 0.01);
    }

    #[test]
    fn self_trade_cancel_provide() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let owner_pk = Pubkey::new_unique();
        let other_pk = Pubkey::new_unique();
        let mut owner = MarginAccount::zeroed();
        let mut other = MarginAccount::zeroed();

        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut owner,
            &owner_pk,
            fixed_order(Side::Ask, 1000, 1),
            0,
        );
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut other,
            &other_pk,
            fixed_order(Side::Ask, 1000, 2),
            1,
        );

        let mut order = fixed_order(Side::Bid, 1000, 1);
        order.self_trade_behavior = SelfTradeBehavior::CancelProvide;
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut owner,
            &owner_pk,
            order,
            2,
        );
        assert_eq!(summary.total_base_taken, 1);

        // the own resting order is cancelled without a fill, then the other
        // maker matches
        assert_eq!(event_queue.len(), 2);
        let out = out_at(&event_queue, 0);
        assert_eq!(out.owner, owner_pk);
        assert_eq!(out.quantity, 1);
        let fill = fill_at(&event_queue, 1);
        assert_eq!(fill.maker, other_pk);
        assert_eq!(fill.quantity, 1);

        assert_eq!(book.asks.root(BookSideOrderTree::Fixed).leaf_count, 1);
    }

    #[test]
    fn self_trade_abort_transaction() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let owner_pk = Pubkey::new_unique();
        let mut owner = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut owner,
            &owner_pk,
            fixed_order(Side::Ask, 1000, 1),
            0,
        );

        let mut order = fixed_order(Side::Bid, 1000, 1);
        order.self_trade_behavior = SelfTradeBehavior::AbortTransaction;
        let err = book
            .new_order(
                &order,
                &mut market,
                &mut event_queue,
                ORACLE_PRICE_LOTS,
                &mut owner,
                &owner_pk,
                1,
                u8::MAX,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::MeridianError::MeridianErrorCode {
                meridian_error_code: MeridianErrorCode::WouldSelfTrade,
                ..
            }
        ));

        // nothing happened
        assert_eq!(event_queue.len(), 0);
        assert_eq!(book.asks.root(BookSideOrderTree::Fixed).leaf_count, 1);
        assert_eq!(owner.perp_position.taker_base, 0);
    }

    #[test]
    fn pegged_orders_match_at_effective_price() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        let pegged_bid = Order {
            side: Side::Bid,
            max_base_quantity: 2,
            max_quote_quantity: i64::MAX,
            client_order_id: 7,
            time_in_force: 0,
            self_trade_behavior: SelfTradeBehavior::DecrementTake,
            params: OrderParams::OraclePegged {
                price_offset_lots: -100,
                order_type: PostOrderType::Limit,
                peg_limit: 4950,
            },
        };
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            pegged_bid,
            0,
        );
        assert!(summary.posted_order_id.is_some());
        assert_eq!(
            book.bids.root(BookSideOrderTree::OraclePegged).leaf_count,
            1
        );

        // effective price is oracle + offset = 4900
        assert_eq!(book.best_price(Side::Bid, 1, ORACLE_PRICE_LOTS), Some(4900));

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            fixed_order(Side::Ask, 4900, 1),
            1,
        );
        assert_eq!(summary.total_base_taken, 1);
        assert_eq!(fill_at(&event_queue, 0).price, 4900);
    }

    // A pegged order whose effective price crosses its peg limit is skipped
    // during matching but stays resting.
    #[test]
    fn pegged_order_beyond_peg_limit_is_inert() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        let pegged_bid = Order {
            side: Side::Bid,
            max_base_quantity: 2,
            max_quote_quantity: i64::MAX,
            client_order_id: 7,
            time_in_force: 0,
            self_trade_behavior: SelfTradeBehavior::DecrementTake,
            params: OrderParams::OraclePegged {
                price_offset_lots: -100,
                order_type: PostOrderType::Limit,
                peg_limit: 4950,
            },
        };
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            pegged_bid,
            0,
        );

        // reference moved up: effective price 5100 - 100 = 5000 > peg limit
        let moved_oracle = 5100;
        assert_eq!(book.bids.best_price(1, moved_oracle), None);

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let order = fixed_order(Side::Ask, 4000, 1);
        let summary = book
            .new_order(
                &order,
                &mut market,
                &mut event_queue,
                moved_oracle,
                &mut taker,
                &taker_pk,
                1,
                u8::MAX,
            )
            .unwrap();

        // no fill, the ask posted, the pegged bid is still there
        assert_eq!(summary.total_base_taken, 0);
        assert!(summary.posted_order_id.is_some());
        assert_eq!(event_queue.len(), 0);
        assert_eq!(
            book.bids.root(BookSideOrderTree::OraclePegged).leaf_count,
            1
        );

        // once the reference falls back, it becomes executable again
        assert_eq!(book.bids.best_price(1, 4900), Some(4800));
    }

    // Fixed and pegged trees merge into one best-price view.
    #[test]
    fn fixed_and_pegged_merge_at_read_time() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Bid, 5005, 1),
            0,
        );
        let pegged_bid = Order {
            side: Side::Bid,
            max_base_quantity: 1,
            max_quote_quantity: i64::MAX,
            client_order_id: 0,
            time_in_force: 0,
            self_trade_behavior: SelfTradeBehavior::DecrementTake,
            params: OrderParams::OraclePegged {
                price_offset_lots: 10,
                order_type: PostOrderType::Limit,
                peg_limit: -1,
            },
        };
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            pegged_bid,
            1,
        );

        // pegged at 5010 beats fixed at 5005
        assert_eq!(book.best_price(Side::Bid, 2, ORACLE_PRICE_LOTS), Some(5010));

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            fixed_order(Side::Ask, 5000, 2),
            2,
        );
        assert_eq!(summary.total_base_taken, 2);
        assert_eq!(fill_at(&event_queue, 0).price, 5010);
        assert_eq!(fill_at(&event_queue, 1).price, 5005);
    }

    // The match-count limit bounds per-call work; the caller re-invokes to
    // continue and the unposted remainder is visible in the summary.
    #[test]
    fn match_count_limit_stops_matching() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 100, 1),
            0,
        );
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 100, 1),
            1,
        );

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let summary = book
            .new_order(
                &fixed_order(Side::Bid, 100, 2),
                &mut market,
                &mut event_queue,
                ORACLE_PRICE_LOTS,
                &mut taker,
                &taker_pk,
                2,
                1, // match-count limit
            )
            .unwrap();
        assert_eq!(summary.total_base_taken, 1);
        assert!(summary.posted_order_id.is_none());
        assert_eq!(event_queue.len(), 1);
        // the second ask is untouched
        assert_eq!(book.asks.root(BookSideOrderTree::Fixed).leaf_count, 1);
    }

    // An expired resting order is not a valid counter-order; matching evicts
    // it with an out event and no fill.
    #[test]
    fn expired_maker_is_evicted_not_filled() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        let mut order = fixed_order(Side::Ask, 100, 1);
        order.time_in_force = 10;
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            order,
            1000,
        );

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            fixed_order(Side::Bid, 100, 1),
            2000, // long past expiry
        );

        assert_eq!(summary.total_base_taken, 0);
        assert!(summary.posted_order_id.is_some());
        assert_eq!(event_queue.len(), 1);
        let out = out_at(&event_queue, 0);
        assert_eq!(out.owner, maker_pk);
        assert_eq!(out.quantity, 1);
        assert_eq!(book.asks.root(BookSideOrderTree::Fixed).leaf_count, 0);
    }

    // A full event queue makes the whole matching call a no-op.
    #[test]
    fn full_event_queue_rejects_matching() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::with_capacity(1);
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 100, 1),
            0,
        );
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 101, 1),
            1,
        );

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        let err = book
            .new_order(
                &fixed_order(Side::Bid, 101, 2),
                &mut market,
                &mut event_queue,
                ORACLE_PRICE_LOTS,
                &mut taker,
                &taker_pk,
                2,
                u8::MAX,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::MeridianError::MeridianErrorCode {
                meridian_error_code: MeridianErrorCode::EventQueueFull,
                ..
            }
        ));

        // the first fill was rolled back together with the failed second one
        assert_eq!(event_queue.len(), 0);
        assert_eq!(book.asks.root(BookSideOrderTree::Fixed).leaf_count, 2);
        let root = *book.asks.root(BookSideOrderTree::Fixed);
        let (_, best) = book.asks.nodes.min_leaf(&root).unwrap();
        assert_eq!(best.quantity, 1);
        assert_eq!(taker.perp_position.taker_base, 0);
    }

    // Check what happens when one side of the book fills up.
    #[test]
    fn book_bids_full() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let mut accounts: Vec<(Pubkey, Box<MarginAccount>)> = (0..10)
            .map(|_| (Pubkey::new_unique(), Box::new(MarginAccount::zeroed())))
            .collect();

        // insert bids until the side is full; the first order expires early
        let mut i = 0usize;
        loop {
            if book.bids.is_full() {
                break;
            }
            let (pk, account) = &mut accounts[i / MAX_OPEN_ORDERS];
            let pk = *pk;
            let mut order = fixed_order(Side::Bid, 1000 + i as i64, 1);
            if i == 1 {
                order.time_in_force = 100;
            }
            place(
                &mut book,
                &mut event_queue,
                &mut market,
                account,
                &pk,
                order,
                1_000_000,
            );
            i += 1;
        }
        let full_count = book.bids.root(BookSideOrderTree::Fixed).leaf_count;
        assert_eq!(full_count as usize, i);

        // a better bid boots the worst one out
        let booter_pk = Pubkey::new_unique();
        let mut booter = MarginAccount::zeroed();
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut booter,
            &booter_pk,
            fixed_order(Side::Bid, 1000 + i as i64 + 1, 1),
            1_000_001,
        );
        assert!(summary.posted_order_id.is_some());
        assert_eq!(event_queue.len(), 1);
        assert_eq!(out_at(&event_queue, 0).quantity, 1);
        assert_eq!(
            book.bids.root(BookSideOrderTree::Fixed).leaf_count,
            full_count
        );
        // the worst price (1001; 1000 expired-slot aside) is gone
        let root = *book.bids.root(BookSideOrderTree::Fixed);
        let (_, worst) = book.bids.nodes.min_leaf(&root).unwrap();
        assert!(fixed_price_lots(worst.price_data()) > 1000);

        // a worse bid cannot evict anything: fills stay absent and the
        // remainder is reported, not silently discarded
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut booter,
            &booter_pk,
            fixed_order(Side::Bid, 2, 3),
            1_000_002,
        );
        assert!(summary.posted_order_id.is_none());
        assert_eq!(summary.not_posted_quantity, 3);
        assert_eq!(
            book.bids.root(BookSideOrderTree::Fixed).leaf_count,
            full_count
        );

        // after the early order expired, posting drops it to make room
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut booter,
            &booter_pk,
            fixed_order(Side::Bid, 999, 1),
            2_000_000,
        );
        assert!(summary.posted_order_id.is_some());
        assert_eq!(summary.not_posted_quantity, 0);
    }

    // Partial match succeeds, then the remainder cannot rest because the
    // account ran out of order slots: fills are kept, remainder reported.
    #[test]
    fn partial_match_with_unpostable_remainder() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let maker_pk = Pubkey::new_unique();
        let mut maker = MarginAccount::zeroed();
        place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut maker,
            &maker_pk,
            fixed_order(Side::Ask, 100, 1),
            0,
        );

        let taker_pk = Pubkey::new_unique();
        let mut taker = MarginAccount::zeroed();
        // burn all open order slots
        for slot in 0..MAX_OPEN_ORDERS {
            taker.orders[slot] = 12345 + slot as u128;
        }

        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut taker,
            &taker_pk,
            fixed_order(Side::Bid, 100, 3),
            1,
        );
        assert_eq!(summary.total_base_taken, 1);
        assert!(summary.posted_order_id.is_none());
        assert_eq!(summary.not_posted_quantity, 2);
        assert_eq!(event_queue.len(), 1);
        assert_eq!(book.bids.root(BookSideOrderTree::Fixed).leaf_count, 0);
    }

    #[test]
    fn cancel_by_id_and_client_id() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let owner_pk = Pubkey::new_unique();
        let mut owner = MarginAccount::zeroed();
        let mut order = fixed_order(Side::Bid, 100, 2);
        order.client_order_id = 42;
        let summary = place(
            &mut book,
            &mut event_queue,
            &mut market,
            &mut owner,
            &owner_pk,
            order,
            0,
        );
        let order_id = summary.posted_order_id.unwrap();

        // cancel by client id resolves through the account's slots
        let (found_id, side_and_tree) = owner.find_order_with_client_id(42).unwrap();
        assert_eq!(found_id, order_id);
        let leaf = book
            .cancel_order(&mut owner, found_id, side_and_tree, Some(owner_pk))
            .unwrap();
        assert_eq!(leaf.quantity, 2);
        assert_eq!(owner.perp_position.bids_quantity, 0);
        assert_eq!(book.bids.root(BookSideOrderTree::Fixed).leaf_count, 0);
        // cancels never produce settlement events
        assert_eq!(event_queue.len(), 0);

        // cancelling again reports the id as unknown
        assert!(book
            .cancel_order(&mut owner, order_id, side_and_tree, Some(owner_pk))
            .is_err());
    }

    #[test]
    fn cancel_all_with_limit() {
        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let owner_pk = Pubkey::new_unique();
        let mut owner = MarginAccount::zeroed();
        for p in 0..4 {
            place(
                &mut book,
                &mut event_queue,
                &mut market,
                &mut owner,
                &owner_pk,
                fixed_order(Side::Bid, 100 + p, 1),
                p as u64,
            );
        }

        book.cancel_all_orders(&mut owner, &owner_pk, 3).unwrap();
        assert_eq!(book.bids.root(BookSideOrderTree::Fixed).leaf_count, 1);

        book.cancel_all_orders(&mut owner, &owner_pk, u8::MAX).unwrap();
        assert_eq!(book.bids.root(BookSideOrderTree::Fixed).leaf_count, 0);
        assert_eq!(owner.next_order_slot(), Some(0));
        assert_eq!(owner.perp_position.bids_quantity, 0);
    }

    // For any matched+posted order: taken + posted + reported-unpostable
    // equals the requested base quantity.
    #[test]
    fn conservation_over_random_flow() {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let book_accs = OrderbookAccounts::new();
        let mut book = book_accs.book();
        let queue_acc = EventQueueAccount::new();
        let mut event_queue = queue_acc.queue();
        let mut market = test_market();

        let pks = [Pubkey::new_unique(), Pubkey::new_unique()];
        let mut accounts = [
            Box::new(MarginAccount::zeroed()),
            Box::new(MarginAccount::zeroed()),
        ];

        for step in 0..300u64 {
            let who = rng.gen_range(0..2);
            let side = if rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
            let price = rng.gen_range(90..110);
            let quantity = rng.gen_range(1..10);
            let ioc = rng.gen_bool(0.3);

            let mut order = fixed_order(side, price, quantity);
            order.self_trade_behavior = SelfTradeBehavior::CancelProvide;
            if ioc {
                order.params = OrderParams::ImmediateOrCancel { price_lots: price };
            }

            // cancel-all every now and then so the books turn over
            if step % 97 == 0 {
                let pk = pks[who];
                book.cancel_all_orders(&mut accounts[who], &pk, u8::MAX)
                    .unwrap();
            }

            let summary = book
                .new_order(
                    &order,
                    &mut market,
                    &mut event_queue,
                    ORACLE_PRICE_LOTS,
                    &mut accounts[who],
                    &pks[who],
                    step,
                    u8::MAX,
                )
                .unwrap();

            let posted_quantity = match summary.posted_order_id {
                Some(id) => {
                    let bookside = book.bookside(side);
                    bookside
                        .iter_all_including_invalid(step, ORACLE_PRICE_LOTS)
                        .find(|it| it.node.key == id)
                        .unwrap()
                        .node
                        .quantity
                }
                None => 0,
            };
            if ioc {
                assert_eq!(posted_quantity, 0);
                assert!(summary.total_base_taken <= quantity);
            } else {
                assert_eq!(
                    summary.total_base_taken + posted_quantity + summary.not_posted_quantity,
                    quantity
                );
            }

            // drain the queue occasionally like a keeper would
            if event_queue.len() > 400 {
                while event_queue.pop_front().is_ok() {}
            }
        }
    }
}
