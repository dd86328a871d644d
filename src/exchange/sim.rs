//! In-memory exchange simulator for tests.
//!
//! Behavior is scripted: post-only rejections, immediate fills, and terminal
//! transitions are driven explicitly so scenarios stay deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::types::{
    AccountInfo, AssetBalance, Kline, OrderFill, OrderRequest, OrderResponse, OrderStatus,
    OrderType, Side, SymbolFilters,
};

#[derive(Default)]
struct SimState {
    orders: HashMap<String, OrderResponse>,
    balances: HashMap<String, f64>,
    klines: HashMap<String, Vec<Kline>>,
    /// Next N LIMIT_MAKER placements are rejected as would-be takers.
    post_only_rejects: u32,
    /// When set, new orders come back FILLED in the create response.
    fill_on_create: bool,
    /// Audit trail of every submitted request.
    placed: Vec<OrderRequest>,
}

/// Scriptable in-memory [`Exchange`] implementation.
pub struct SimExchange {
    state: Mutex<SimState>,
    filters: SymbolFilters,
    next_order_id: AtomicI64,
}

impl Default for SimExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SimExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            filters: SymbolFilters {
                tick_size: 0.01,
                step_size: 0.000001,
                min_qty: 0.000001,
                min_notional: 5.0,
            },
            next_order_id: AtomicI64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_balance(&self, asset: &str, free: f64) {
        self.lock().balances.insert(asset.to_string(), free);
    }

    pub fn set_klines(&self, interval: &str, klines: Vec<Kline>) {
        self.lock().klines.insert(interval.to_string(), klines);
    }

    /// Script the next `n` maker placements to fail as would-be takers.
    pub fn reject_next_post_only(&self, n: u32) {
        self.lock().post_only_rejects = n;
    }

    /// Script create responses to report an immediate fill.
    pub fn set_fill_on_create(&self, enabled: bool) {
        self.lock().fill_on_create = enabled;
    }

    /// Transition a resting order to FILLED (it leaves the open set).
    pub fn mark_filled(&self, client_order_id: &str) {
        let mut state = self.lock();
        if let Some(order) = state.orders.get_mut(client_order_id) {
            order.status = OrderStatus::Filled;
            order.executed_qty = order.orig_qty.clone();
        }
    }

    /// Transition a resting order to CANCELED.
    pub fn mark_canceled(&self, client_order_id: &str) {
        let mut state = self.lock();
        if let Some(order) = state.orders.get_mut(client_order_id) {
            order.status = OrderStatus::Canceled;
        }
    }

    /// Drop an order entirely, as if the exchange never heard of it.
    pub fn forget_order(&self, client_order_id: &str) {
        self.lock().orders.remove(client_order_id);
    }

    /// Pre-seed an order (restart scenarios).
    pub fn seed_order(
        &self,
        client_order_id: &str,
        symbol: &str,
        side: Side,
        price: f64,
        qty: f64,
        status: OrderStatus,
    ) {
        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let executed = if status == OrderStatus::Filled {
            format!("{qty}")
        } else {
            "0".to_string()
        };
        let resp = OrderResponse {
            symbol: symbol.to_string(),
            order_id,
            client_order_id: client_order_id.to_string(),
            transact_time: 0,
            price: format!("{price}"),
            orig_qty: format!("{qty}"),
            executed_qty: executed,
            cummulative_quote_qty: "0".to_string(),
            status,
            order_type: "LIMIT".to_string(),
            side,
            fills: Vec::new(),
        };
        self.lock().orders.insert(client_order_id.to_string(), resp);
    }

    /// Every request submitted so far, in order.
    pub fn placed_requests(&self) -> Vec<OrderRequest> {
        self.lock().placed.clone()
    }

    /// Current state of an order, if the simulator knows it.
    pub fn order(&self, client_order_id: &str) -> Option<OrderResponse> {
        self.lock().orders.get(client_order_id).cloned()
    }
}

fn is_open(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::New | OrderStatus::PartiallyFilled)
}

#[async_trait]
impl Exchange for SimExchange {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderResponse> {
        let mut state = self.lock();
        state.placed.push(req.clone());

        if req.order_type == OrderType::LimitMaker && state.post_only_rejects > 0 {
            state.post_only_rejects -= 1;
            return Err(Error::PostOnlyReject);
        }

        let price = req.price.clone().unwrap_or_else(|| "0".to_string());
        let filled = state.fill_on_create;
        let status = if filled {
            OrderStatus::Filled
        } else {
            OrderStatus::New
        };
        let fills = if filled {
            vec![OrderFill {
                price: price.clone(),
                qty: req.quantity.clone(),
                commission: "0".to_string(),
                commission_asset: "BNB".to_string(),
            }]
        } else {
            Vec::new()
        };

        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let resp = OrderResponse {
            symbol: req.symbol.clone(),
            order_id,
            client_order_id: req.client_order_id.clone(),
            transact_time: 0,
            price,
            orig_qty: req.quantity.clone(),
            executed_qty: if filled {
                req.quantity.clone()
            } else {
                "0".to_string()
            },
            cummulative_quote_qty: "0".to_string(),
            status,
            order_type: req.order_type.as_str().to_string(),
            side: req.side,
            fills,
        };
        state
            .orders
            .insert(req.client_order_id.clone(), resp.clone());
        Ok(resp)
    }

    async fn cancel_order(&self, _symbol: &str, client_order_id: &str) -> Result<OrderResponse> {
        let mut state = self.lock();
        match state.orders.get_mut(client_order_id) {
            Some(order) if is_open(order.status) => {
                order.status = OrderStatus::Canceled;
                Ok(order.clone())
            }
            Some(_) | None => Err(Error::OrderNotFound),
        }
    }

    async fn query_order(&self, _symbol: &str, client_order_id: &str) -> Result<OrderResponse> {
        self.lock()
            .orders
            .get(client_order_id)
            .cloned()
            .ok_or(Error::OrderNotFound)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderResponse>> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && is_open(o.status))
            .cloned()
            .collect())
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        let state = self.lock();
        let balances = state
            .balances
            .iter()
            .map(|(asset, free)| AssetBalance {
                asset: asset.clone(),
                free: format!("{free}"),
                locked: "0".to_string(),
            })
            .collect();
        Ok(AccountInfo {
            maker_commission: 10,
            taker_commission: 10,
            can_trade: true,
            balances,
        })
    }

    async fn klines(&self, _symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let state = self.lock();
        let all = state.klines.get(interval).cloned().unwrap_or_default();
        let take = all.len().min(limit as usize);
        Ok(all[all.len() - take..].to_vec())
    }

    async fn exchange_filters(&self, _symbol: &str) -> Result<SymbolFilters> {
        Ok(self.filters)
    }

    async fn start_user_stream(&self) -> Result<String> {
        Ok("sim-listen-key".to_string())
    }

    async fn keepalive_user_stream(&self, _listen_key: &str) -> Result<()> {
        Ok(())
    }

    async fn close_user_stream(&self, _listen_key: &str) -> Result<()> {
        Ok(())
    }
}
