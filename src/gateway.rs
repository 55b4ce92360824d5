// =============================================================================
// Order Gateway — the seam that makes live and backtest interchangeable
// =============================================================================
//
// Strategies never touch a socket. They hold a `GatewayHandle` and call
// `send_order`; whether the order crosses the wire to a real gateway process
// or is filled synchronously by the backtest engine is invisible to them.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::PushProducer;
use crate::codec;
use crate::error::Result;
use crate::types::Order;

/// Anything able to accept an order from a strategy.
///
/// Two implementations exist: the live push gateway below, and the backtest
/// engine's router, which fills orders synchronously.
pub trait OrderGateway: Send {
    fn send_order(&mut self, order: Order) -> Result<()>;
}

/// Shared handle injected into every strategy.
pub type GatewayHandle = Arc<Mutex<dyn OrderGateway>>;

/// Wrap a gateway implementation into the shared handle form.
pub fn gateway_handle(gateway: impl OrderGateway + 'static) -> GatewayHandle {
    Arc::new(Mutex::new(gateway))
}

// ---------------------------------------------------------------------------
// Live gateway
// ---------------------------------------------------------------------------

/// Live-mode gateway: encodes orders and pushes them onto the order bus.
pub struct LivePushGateway {
    producer: PushProducer,
    sent: u64,
    unsent: u64,
}

impl LivePushGateway {
    pub fn new(producer: PushProducer) -> Self {
        Self {
            producer,
            sent: 0,
            unsent: 0,
        }
    }

    /// (orders sent, orders dropped on overflow)
    pub fn stats(&self) -> (u64, u64) {
        (self.sent, self.unsent)
    }
}

impl OrderGateway for LivePushGateway {
    fn send_order(&mut self, order: Order) -> Result<()> {
        let bytes = codec::encode_order(&order);
        match self.producer.send(bytes) {
            Ok(()) => {
                self.sent += 1;
                debug!(
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    side = %order.side,
                    volume = order.volume,
                    price = order.price,
                    "order pushed to gateway"
                );
                Ok(())
            }
            Err(e) => {
                self.unsent += 1;
                warn!(
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    error = %e,
                    "order not sent"
                );
                Err(e)
            }
        }
    }
}
