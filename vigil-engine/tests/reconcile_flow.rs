//! Reconciliation: phantom closures, adoption, idempotence.

mod common;

use chrono::Utc;
use common::{signal, Harness};
use rust_decimal_macros::dec;
use vigil_core::{
    ExchangePosition, ExitReason, OpenOrder, OrderSide, PositionStatus, Side, SignalSide,
    Timeframe, VenueFill,
};
use vigil_paper::PaperVenue;

#[tokio::test(start_paused = true)]
async fn phantom_without_fill_parks_then_resolves_on_late_history() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    let position = h
        .trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");

    // The position vanishes with no fill anywhere in trade history
    // (liquidation indexing lag).
    h.venue.drop_position_silently("BTCUSDT");
    h.reconciler.deep_sync(false).await.unwrap();

    // Never a win or loss from price inference: the row parks instead.
    assert!(h.store.list_trades(h.profile_id(), 10).unwrap().is_empty());
    let parked = h.store.list_waiting_sync(h.profile_id()).unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].status, PositionStatus::WaitingSync);

    // Next cycle the closing fill shows up, right at the stop.
    h.venue.push_fill(VenueFill {
        order_id: "liq-1".into(),
        symbol: "BTCUSDT".into(),
        side: OrderSide::Sell,
        price: position.sl_price,
        qty: position.qty,
        fee: dec!(0.01),
        reduce_only: true,
        timestamp: Utc::now(),
    });
    h.reconciler.deep_sync(false).await.unwrap();

    assert!(h.store.list_waiting_sync(h.profile_id()).unwrap().is_empty());
    let trades = h.store.list_trades(h.profile_id(), 10).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_reason, ExitReason::Sl);
    assert_eq!(trades[0].exit_price, position.sl_price);
    assert_eq!(trades[0].fees, dec!(0.01));
}

#[tokio::test(start_paused = true)]
async fn parked_position_reactivates_when_venue_reports_it_again() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    let position = h
        .trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");

    h.venue.drop_position_silently("BTCUSDT");
    h.reconciler.deep_sync(false).await.unwrap();
    assert_eq!(h.store.list_waiting_sync(h.profile_id()).unwrap().len(), 1);

    // The venue was glitching; the position is still there.
    h.venue.seed_position(ExchangePosition {
        symbol: "BTCUSDT".into(),
        side: Side::Long,
        qty: position.qty,
        entry_price: position.entry_price,
        leverage: position.leverage,
        unrealized_pnl: dec!(0),
    });
    h.reconciler.deep_sync(false).await.unwrap();

    assert!(h.store.list_waiting_sync(h.profile_id()).unwrap().is_empty());
    let active = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .expect("reactivated");
    assert_eq!(active.status, PositionStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn adoption_brings_stray_position_under_management_once() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    // Operator opened this long by hand, with a stop resting on the venue.
    h.venue.seed_position(ExchangePosition {
        symbol: "ETHUSDT".into(),
        side: Side::Long,
        qty: dec!(1.5),
        entry_price: dec!(2000),
        leverage: 3,
        unrealized_pnl: dec!(0),
    });
    h.venue.seed_order(OpenOrder {
        order_id: "manual-sl".into(),
        client_order_id: None,
        symbol: "ETHUSDT".into(),
        side: OrderSide::Sell,
        qty: dec!(1.5),
        price: None,
        trigger_price: Some(dec!(1940)),
        reduce_only: true,
        conditional: true,
        created_at: Utc::now(),
    });

    h.reconciler.deep_sync(false).await.unwrap();

    let open = h.store.list_open(h.profile_id()).unwrap();
    assert_eq!(open.len(), 1);
    let adopted = &open[0];
    assert_eq!(adopted.timeframe, Timeframe::Adopted);
    assert_eq!(adopted.symbol, "ETHUSDT");
    assert_eq!(adopted.qty, dec!(1.5));
    // The resting stop was inferred; the take profit was synthesized at the
    // default distance.
    assert_eq!(adopted.sl_price, dec!(1940));
    assert_eq!(adopted.sl_order_id.as_deref(), Some("manual-sl"));
    assert_eq!(adopted.tp_price, dec!(2000) * dec!(1.03));

    // Running the reconciler again must not create a second row.
    h.reconciler.deep_sync(false).await.unwrap();
    assert_eq!(h.store.list_open(h.profile_id()).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn steady_state_reconcile_is_a_no_op() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");
    // First pass settles protective-order id adoption.
    h.reconciler.deep_sync(false).await.unwrap();

    let before_rows = h.store.list_open(h.profile_id()).unwrap();
    let before_mutations = h.venue.mutations().len();
    let before_orders = h.venue.open_order_ids();

    h.reconciler.deep_sync(true).await.unwrap();
    h.reconciler.deep_sync(true).await.unwrap();

    let after_rows = h.store.list_open(h.profile_id()).unwrap();
    assert_eq!(before_rows.len(), after_rows.len());
    assert_eq!(before_rows[0].sl_order_id, after_rows[0].sl_order_id);
    assert_eq!(before_rows[0].tp_order_id, after_rows[0].tp_order_id);
    assert_eq!(h.venue.mutations().len(), before_mutations);
    assert_eq!(h.venue.open_order_ids(), before_orders);
}

#[tokio::test(start_paused = true)]
async fn partial_fill_resizes_local_quantity() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    let position = h
        .trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");

    // Venue reports a smaller remaining quantity (partial reduce).
    h.venue.drop_position_silently("BTCUSDT");
    h.venue.seed_position(ExchangePosition {
        symbol: "BTCUSDT".into(),
        side: Side::Long,
        qty: position.qty / dec!(2),
        entry_price: position.entry_price,
        leverage: position.leverage,
        unrealized_pnl: dec!(0),
    });
    h.reconciler.deep_sync(false).await.unwrap();

    let synced = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    assert_eq!(synced.qty, position.qty / dec!(2));
}
