// tests/monitor_tests.rs
use serde_json::json;

use signal_streamer::message::Message;
use signal_streamer::monitors::updates::{MarketUpdate, parse_update};

fn frame(value: serde_json::Value) -> Message {
    serde_json::from_value(value).expect("test frame must deserialize")
}

#[test]
fn parses_a_signal_update() {
    let message = frame(json!({
        "type": "signal_update",
        "sequenceNumber": 7,
        "timestamp": "2026-01-05T09:30:00Z",
        "symbol": "ES",
        "action": "buy",
        "price": 5101.25,
    }));

    match parse_update(&message).unwrap() {
        MarketUpdate::Signal {
            sequence_number,
            update,
        } => {
            assert_eq!(sequence_number, 7);
            assert_eq!(update.symbol, "ES");
            assert_eq!(update.action, "buy");
            assert_eq!(update.price, Some(5101.25));
            assert_eq!(update.reason, None);
        }
        other => panic!("expected a signal update, got {other:?}"),
    }
}

#[test]
fn parses_a_portfolio_update_with_positions() {
    let message = frame(json!({
        "type": "portfolio_update",
        "sequenceNumber": 12,
        "equity": 125000.0,
        "cash": 25000.0,
        "positions": [
            {"symbol": "ES", "quantity": 2.0, "averagePrice": 5080.5},
            {"symbol": "NQ", "quantity": -1.0},
        ],
    }));

    match parse_update(&message).unwrap() {
        MarketUpdate::Portfolio { update, .. } => {
            assert_eq!(update.equity, Some(125000.0));
            assert_eq!(update.positions.len(), 2);
            assert_eq!(update.positions[0].average_price, Some(5080.5));
            assert_eq!(update.positions[1].average_price, None);
        }
        other => panic!("expected a portfolio update, got {other:?}"),
    }
}

#[test]
fn parses_a_pattern_update_without_optional_fields() {
    let message = frame(json!({
        "type": "pattern_update",
        "sequenceNumber": 3,
        "symbol": "NQ",
        "pattern": "double_top",
    }));

    match parse_update(&message).unwrap() {
        MarketUpdate::Pattern { update, .. } => {
            assert_eq!(update.pattern, "double_top");
            assert_eq!(update.confidence, None);
        }
        other => panic!("expected a pattern update, got {other:?}"),
    }
}

#[test]
fn rejects_frames_that_are_not_market_updates() {
    let message = frame(json!({
        "type": "connected",
        "connectionId": "conn-1",
        "sequenceNumber": 0,
    }));

    assert!(parse_update(&message).is_err());
}

#[test]
fn rejects_updates_with_missing_required_fields() {
    let message = frame(json!({
        "type": "signal_update",
        "sequenceNumber": 9,
        "price": 17.5,
    }));

    assert!(parse_update(&message).is_err());
}
