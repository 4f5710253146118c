//! End-to-end trading flows against the paper venue.

mod common;

use common::{signal, Harness};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use vigil_core::{
    CancelHint, ExitReason, PositionStatus, Side, SignalSide, Timeframe,
};
use vigil_broker::ExchangeAdapter;
use vigil_engine::{EngineError, RiskVeto, StructuralLevels};
use vigil_paper::PaperVenue;

#[tokio::test(start_paused = true)]
async fn limit_patience_entry_fills_then_takes_profit() {
    let h = Harness::live(PaperVenue::new("paper"), |cfg| {
        cfg.use_limit_orders = true;
    });
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    let position = h
        .trader
        .open(&slot, &signal(SignalSide::Buy, 0.9, 7.5))
        .await
        .unwrap()
        .expect("entry placed");
    // Limit rests 1.5% below market; protective levels derive from the
    // limit price, not the market print.
    assert_eq!(position.status, PositionStatus::Pending);
    assert_eq!(position.entry_price, dec!(98.5));
    assert_eq!(position.sl_price, dec!(98.5) * dec!(0.985));
    assert_eq!(position.tp_price, dec!(98.5) * dec!(1.03));

    // Price dips through the limit: the entry fills.
    h.venue.set_mark_price("BTCUSDT", dec!(98.4));
    h.trader.poll_pending().await.unwrap();
    let active = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .expect("active row");
    assert_eq!(active.status, PositionStatus::Active);

    // A sync pass adopts the venue-created protective order ids.
    h.reconciler.deep_sync(false).await.unwrap();
    let active = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    assert!(active.sl_order_id.is_some());
    assert!(active.tp_order_id.is_some());

    // Price drifts to the target: the venue fires the take profit.
    let tp = active.tp_price;
    h.venue.set_mark_price("BTCUSDT", tp + dec!(0.01));
    h.reconciler.deep_sync(false).await.unwrap();

    assert!(h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .is_none());
    let trades = h.store.list_trades(h.profile_id(), 10).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_reason, ExitReason::Tp);
    assert_eq!(trades[0].entry_price, dec!(98.5));
    assert!(trades[0].pnl > Decimal::ZERO);
    // No protective remnants survive the closure.
    assert!(h.venue.open_order_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn signal_flip_closes_and_reenters_as_starter() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    let long = h
        .trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 6.0))
        .await
        .unwrap()
        .expect("long opened");
    assert_eq!(long.side, Side::Long);
    assert_eq!(long.leverage, 4); // mid tier

    // Next tick: the signal flips hard the other way.
    h.trader
        .manage_active(&slot, &signal(SignalSide::Sell, 0.8, 6.0))
        .await
        .unwrap();

    let trades = h.store.list_trades(h.profile_id(), 10).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_reason, ExitReason::SignalFlip);

    let starter = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .expect("starter re-entry");
    assert_eq!(starter.side, Side::Short);
    // Leverage reduced 40% (4 -> 2) and the stop sits tighter than the
    // standard 1.5% distance.
    assert_eq!(starter.leverage, 2);
    let sl_distance = (starter.sl_price - starter.entry_price) / starter.entry_price;
    assert!(sl_distance < dec!(0.015));
    assert!(sl_distance > Decimal::ZERO); // short: stop above entry
}

#[tokio::test(start_paused = true)]
async fn missing_stop_is_recreated_once_per_cooldown() {
    // Algo-separate venue: the engine places protection itself.
    let h = Harness::live(PaperVenue::new("paper").without_attached_protection(), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");
    let position = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    let sl_id = position.sl_order_id.clone().expect("separate SL placed");

    // The stop vanishes from the venue.
    h.venue
        .cancel_order("BTCUSDT", &sl_id, CancelHint::Conditional)
        .await
        .unwrap();
    let before = h.venue.open_order_ids().len();

    // First repair pass recreates it.
    h.reconciler.deep_sync(false).await.unwrap();
    let repaired = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    let new_sl = repaired.sl_order_id.clone().expect("sl recreated");
    assert_ne!(new_sl, sl_id);
    assert_eq!(h.venue.open_order_ids().len(), before + 1);

    // Kill it again immediately: the 20s per-position creation cooldown
    // blocks a second recreation in the same window.
    h.venue
        .cancel_order("BTCUSDT", &new_sl, CancelHint::Conditional)
        .await
        .unwrap();
    let before = h.venue.open_order_ids().len();
    h.reconciler.deep_sync(false).await.unwrap();
    assert_eq!(h.venue.open_order_ids().len(), before);
}

#[tokio::test(start_paused = true)]
async fn stop_loss_starts_cooldown_that_blocks_reentry() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    let position = h
        .trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");

    // Price collapses through the stop; the venue fires it.
    h.venue.set_mark_price("BTCUSDT", position.sl_price - dec!(0.01));
    h.reconciler.deep_sync(false).await.unwrap();

    let trades = h.store.list_trades(h.profile_id(), 10).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_reason, ExitReason::Sl);
    assert!(trades[0].pnl < Decimal::ZERO);

    // Any re-entry on the symbol is denied while the cooldown runs,
    // regardless of timeframe.
    h.venue.set_mark_price("BTCUSDT", dec!(100));
    let err = h
        .trader
        .open(&slot, &signal(SignalSide::Buy, 0.9, 7.5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Vetoed(RiskVeto::Cooldown(_))));
    let other_tf = common::slot_for(h.profile_id(), "BTC", Timeframe::H4);
    let err = h
        .trader
        .open(&other_tf, &signal(SignalSide::Buy, 0.9, 7.5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Vetoed(RiskVeto::Cooldown(_))));
}

#[tokio::test(start_paused = true)]
async fn cancelling_pending_entry_leaves_no_venue_state() {
    let h = Harness::live(PaperVenue::new("paper"), |cfg| {
        cfg.use_limit_orders = true;
    });
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("pending entry");
    assert!(!h.venue.open_order_ids().is_empty());

    // Strong reversal cancels immediately, no rest period required.
    h.trader
        .review_pending(&slot, &signal(SignalSide::Sell, 0.9, 5.0))
        .await
        .unwrap();

    assert!(h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .is_none());
    assert!(h.venue.open_order_ids().is_empty());
    // Cancellations do not produce ledger rows.
    assert!(h.store.list_trades(h.profile_id(), 10).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn weak_opposition_waits_for_rest_period() {
    let h = Harness::live(PaperVenue::new("paper"), |cfg| {
        cfg.use_limit_orders = true;
        cfg.strong_reversal_threshold = 0.4;
    });
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("pending entry");

    // Weak opposite signal inside the rest window must not cancel.
    h.trader
        .review_pending(&slot, &signal(SignalSide::Sell, 0.3, 2.0))
        .await
        .unwrap();
    let still = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .expect("still pending");
    assert_eq!(still.status, PositionStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn profit_lock_moves_stop_into_profit_once() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");
    let opened = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    let target = opened.tp_price - opened.entry_price;

    // 80% of the way to target engages the lock.
    let trigger_price = opened.entry_price + target * dec!(0.8);
    h.venue.set_mark_price("BTCUSDT", trigger_price);
    h.trader
        .manage_active(&slot, &signal(SignalSide::Buy, 0.8, 4.0))
        .await
        .unwrap();

    let locked = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    assert!(locked.profit_locked);
    // Stop now sits 10% of the target distance above entry.
    assert_eq!(locked.sl_price, opened.entry_price + target * dec!(0.1));
    let locked_sl = locked.sl_price;

    // One-shot: a later tick at an even better price does not move it again.
    h.venue
        .set_mark_price("BTCUSDT", trigger_price + dec!(0.1));
    h.trader
        .manage_active(&slot, &signal(SignalSide::Buy, 0.8, 4.0))
        .await
        .unwrap();
    let after = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    assert_eq!(after.sl_price, locked_sl);
}

#[tokio::test(start_paused = true)]
async fn take_profit_extends_toward_structure_capped() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");
    let opened = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    let original_distance = opened.tp_price - opened.entry_price;

    // Resistance far beyond the cap: the extension clamps at 1.5x.
    h.market.set_levels(
        "BTCUSDT",
        StructuralLevels {
            support: None,
            resistance: Some(opened.entry_price + original_distance * dec!(3)),
            atr: None,
        },
    );
    h.trader
        .manage_active(&slot, &signal(SignalSide::Buy, 0.8, 4.0))
        .await
        .unwrap();

    let extended = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    assert!(extended.tp_extended);
    assert_eq!(
        extended.tp_price,
        opened.entry_price + original_distance * dec!(1.5)
    );
}

#[tokio::test(start_paused = true)]
async fn collapsed_confidence_tightens_stop_halfway() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");
    let opened = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();

    // Confidence falls below half of the entry confidence.
    h.trader
        .manage_active(&slot, &signal(SignalSide::Buy, 0.3, 1.0))
        .await
        .unwrap();

    let tightened = h
        .store
        .get_active(h.profile_id(), &slot.pos_key())
        .unwrap()
        .unwrap();
    assert!(tightened.sl_tightened);
    assert_eq!(
        tightened.sl_price,
        (opened.sl_price + opened.entry_price) / dec!(2)
    );
}

#[tokio::test(start_paused = true)]
async fn reaper_spares_managed_orders_and_cancels_orphans() {
    let h = Harness::live(PaperVenue::new("paper").without_attached_protection(), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened with separate protection");
    let managed: std::collections::HashSet<String> =
        h.venue.open_order_ids().into_iter().collect();
    assert_eq!(managed.len(), 2);

    // A stale engine order with no backing row, well past the grace window.
    h.venue.seed_order(vigil_core::OpenOrder {
        order_id: "stale-1".into(),
        client_order_id: Some("bot_PAPER_ETHUSDT_BUY_1000".into()),
        symbol: "ETHUSDT".into(),
        side: vigil_core::OrderSide::Buy,
        qty: dec!(1),
        price: Some(dec!(1900)),
        trigger_price: None,
        reduce_only: false,
        conditional: false,
        created_at: chrono::Utc::now(),
    });
    // A foreign order outside the traded universe.
    h.venue.seed_order(vigil_core::OpenOrder {
        order_id: "foreign-1".into(),
        client_order_id: Some("someone-elses-bot".into()),
        symbol: "DOGEUSDT".into(),
        side: vigil_core::OrderSide::Buy,
        qty: dec!(100),
        price: Some(dec!(0.1)),
        trigger_price: None,
        reduce_only: false,
        conditional: false,
        created_at: chrono::Utc::now(),
    });
    // A foreign order inside the universe: not ours to touch.
    h.venue.seed_order(vigil_core::OpenOrder {
        order_id: "manual-1".into(),
        client_order_id: Some("manual-entry".into()),
        symbol: "ETHUSDT".into(),
        side: vigil_core::OrderSide::Buy,
        qty: dec!(1),
        price: Some(dec!(1800)),
        trigger_price: None,
        reduce_only: false,
        conditional: false,
        created_at: chrono::Utc::now(),
    });

    let reaped = h.trader.reap_orphans().await.unwrap();
    assert_eq!(reaped, 2);

    let remaining: std::collections::HashSet<String> =
        h.venue.open_order_ids().into_iter().collect();
    assert!(remaining.contains("manual-1"));
    for id in &managed {
        assert!(remaining.contains(id), "managed order {id} was reaped");
    }
    assert!(!remaining.contains("stale-1"));
    assert!(!remaining.contains("foreign-1"));
}

#[tokio::test(start_paused = true)]
async fn second_timeframe_is_blocked_while_symbol_is_held() {
    let h = Harness::live(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    h.trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("opened");

    let other_tf = common::slot_for(h.profile_id(), "BTC", Timeframe::H4);
    let second = h
        .trader
        .open(&other_tf, &signal(SignalSide::Buy, 0.9, 7.5))
        .await
        .unwrap();
    assert!(second.is_none());
    assert_eq!(h.store.list_open(h.profile_id()).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dry_run_never_touches_the_venue() {
    let h = Harness::dry_run(PaperVenue::new("paper"), |_| {});
    let slot = h.btc_slot();
    h.venue.set_mark_price("BTCUSDT", dec!(100));

    let position = h
        .trader
        .open(&slot, &signal(SignalSide::Buy, 0.8, 7.0))
        .await
        .unwrap()
        .expect("simulated entry");
    assert_eq!(position.status, PositionStatus::Active);
    assert!(position
        .entry_order_id
        .as_deref()
        .unwrap()
        .starts_with("dry_"));

    // Price reaches the simulated take profit.
    h.venue.set_mark_price("BTCUSDT", position.tp_price);
    h.trader
        .manage_active(&slot, &signal(SignalSide::Buy, 0.8, 4.0))
        .await
        .unwrap();

    let trades = h.store.list_trades(h.profile_id(), 10).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_reason, ExitReason::Tp);
    // The venue saw no orders, no positions, nothing.
    assert!(h.venue.mutations().is_empty());
}
