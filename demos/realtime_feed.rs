//! Realtime feed listener.
//!
//! Connects to the backend socket, subscribes to the configured channels and logs every decoded
//! trading event plus connection state changes until Ctrl-C.
//!
//! Run with:
//! ```sh
//! TRADING_WS_URL=ws://localhost:8000/ws TRADING_WS_CHANNELS=prices,signals \
//!     RUST_LOG=info,trading_realtime=debug cargo run --example realtime_feed
//! ```

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trading_realtime::events::{self, TradingEvent};
use trading_realtime::ws::ConnectionManager;
use trading_realtime::ws::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let manager = ConnectionManager::new(config);
    info!(endpoint = manager.endpoint(), "Starting realtime feed");

    let _events = events::subscribe(&manager, |event| match event {
        TradingEvent::Tick(tick) => info!(
            symbol = %tick.symbol,
            bid = %tick.bid,
            ask = %tick.ask,
            spread = %tick.spread()
        ),
        TradingEvent::TradingSignal(signal) => info!(
            symbol = %signal.symbol,
            entry = %signal.entry_price,
            stop_loss = %signal.stop_loss,
            take_profit = %signal.take_profit,
            "Trading signal"
        ),
        TradingEvent::Prediction(prediction) => info!(
            symbol = %prediction.symbol,
            direction = %prediction.direction,
            confidence = %prediction.confidence,
            "Prediction"
        ),
        TradingEvent::Error(error) => warn!(message = %error.message, "Server error"),
        other => info!(symbol = ?other.symbol(), event = ?other),
    });
    let _connected = manager.on_connect(|| info!("Connected"));
    let _disconnected = manager.on_disconnect(|| warn!("Disconnected"));

    let mut states = manager.state_receiver();
    manager.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(?state, "Connection state");
            }
        }
    }

    manager.disconnect().await;
    info!("Feed stopped");

    Ok(())
}
