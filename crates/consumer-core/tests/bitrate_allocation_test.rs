//! The four-phase bitrate probing protocol between a consumer and the
//! external congestion allocator.

mod common;

use std::sync::Arc;

use rsfu_consumer_core::prelude::*;

use common::{media_packet, video_consumer, MockProducerStream, RecordingListener, LAYER_SSRCS};

/// A consumer under external bitrate management with two active layers:
/// layer 0 (cumulative 200/450/600 kbps) and layer 1 (700 kbps base).
fn managed_consumer() -> (
    SimulcastConsumer,
    Vec<Arc<MockProducerStream>>,
    RecordingListener,
) {
    let (mut consumer, _rx) = video_consumer();
    let mut listener = RecordingListener::default();

    consumer.set_externally_managed_bitrate();

    let stream0 = MockProducerStream::new(LAYER_SSRCS[0], 3);
    stream0.set_score(8);
    stream0.set_bitrates(vec![200_000, 450_000, 600_000]);
    stream0.set_layer_bitrates(vec![200_000, 250_000, 600_000]);
    stream0.set_sender_report(1000, 0);

    let stream1 = MockProducerStream::new(LAYER_SSRCS[1], 3);
    stream1.set_score(8);
    stream1.set_bitrates(vec![700_000, 0, 0]);
    stream1.set_sender_report(1000, 0);

    consumer.on_producer_new_rtp_stream(stream0.clone(), LAYER_SSRCS[0], &mut listener);
    consumer.on_producer_new_rtp_stream(stream1.clone(), LAYER_SSRCS[1], &mut listener);
    consumer.transport_connected(&mut listener);

    (consumer, vec![stream0, stream1], listener)
}

#[test]
fn test_bitrate_priority_is_highest_viable_layer_plus_one() {
    let (consumer, _streams, _listener) = managed_consumer();

    // Layers 0 and 1 are viable, layer 2 is absent.
    assert_eq!(consumer.get_bitrate_priority(), 2);
}

#[test]
fn test_bitrate_priority_ignores_layers_above_preference() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    consumer
        .handle_request(
            ConsumerRequest::SetPreferredLayers(serde_json::json!({ "spatialLayer": 0 })),
            &mut listener,
        )
        .unwrap();

    // Layer 1 is viable but above the preference while layer 0 is viable.
    assert_eq!(consumer.get_bitrate_priority(), 1);
}

#[test]
fn test_bitrate_priority_is_one_with_no_viable_layer() {
    let (consumer, streams, _listener) = managed_consumer();

    streams[0].set_score(0);
    streams[1].set_score(0);

    // Still > 0 so the allocator keeps calling use_available_bitrate and
    // the consumer can reach the no-target state.
    assert_eq!(consumer.get_bitrate_priority(), 1);
}

#[test]
fn test_bitrate_priority_is_zero_when_inactive() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    consumer.transport_disconnected(&mut listener);

    assert_eq!(consumer.get_bitrate_priority(), 0);
}

/// The allocator round from the worked example: 500 kbps available at 1%
/// loss gives a 540 kbps virtual budget; layer 0 temporal 1 (450 kbps)
/// fits, temporal 2 (600 kbps) does not.
#[test]
fn test_use_available_bitrate_picks_largest_fitting_pair() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    // fraction_lost 2/256 is ~0.8%, below the 2% probing threshold.
    consumer.send_stream_mut().set_fraction_lost(2);

    let consumed = consumer.use_available_bitrate(500_000, true);
    assert_eq!(consumed, 450_000);

    // Temporal 2 needs 600 kbps, above the 540 kbps virtual budget.
    assert_eq!(consumer.increase_temporal_layer(500_000, true), 0);

    // Committing moves the provisional choice into the targets and asks
    // the new layer for a key frame.
    listener.key_frame_requests.clear();
    consumer.apply_layers(&mut listener);
    assert_eq!(consumer.target_layers(), (0, 1));
    assert_eq!(listener.key_frame_requests, vec![LAYER_SSRCS[0]]);
}

#[test]
fn test_use_available_bitrate_without_loss_consideration() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    // 460 kbps plain budget: layer 0 temporal 1 (450 kbps) fits exactly.
    let consumed = consumer.use_available_bitrate(460_000, false);
    assert_eq!(consumed, 450_000);

    consumer.apply_layers(&mut listener);
    assert_eq!(consumer.target_layers(), (0, 1));
}

/// When the plan only fits thanks to the low-loss probing headroom, the
/// consumer reports the real budget as consumed.
#[test]
fn test_use_available_bitrate_clamps_to_given_bitrate() {
    let (mut consumer, _streams, _listener) = managed_consumer();

    // Virtual budget 1.08 * 430k = 464k covers temporal 1 (450k) while the
    // real budget does not.
    let consumed = consumer.use_available_bitrate(430_000, true);
    assert_eq!(consumed, 430_000);
}

#[test]
fn test_use_available_bitrate_with_nothing_viable() {
    let (mut consumer, streams, mut listener) = managed_consumer();

    streams[0].set_score(0);
    streams[1].set_score(0);

    assert_eq!(consumer.use_available_bitrate(500_000, true), 0);

    // Applying the empty plan clears the targets.
    consumer.apply_layers(&mut listener);
    assert_eq!(consumer.target_layers(), (-1, -1));
}

#[test]
fn test_use_available_bitrate_returns_zero_when_inactive() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    consumer.transport_disconnected(&mut listener);

    assert_eq!(consumer.use_available_bitrate(500_000, true), 0);
}

/// A successful temporal upgrade consumes the incremental layer bitrate.
#[test]
fn test_increase_temporal_layer_commits_next_active_layer() {
    let (mut consumer, streams, mut listener) = managed_consumer();

    // Make the temporal-2 increment affordable.
    streams[0].set_layer_bitrates(vec![200_000, 250_000, 80_000]);

    assert_eq!(consumer.use_available_bitrate(500_000, false), 450_000);
    assert_eq!(consumer.increase_temporal_layer(500_000, false), 80_000);

    consumer.apply_layers(&mut listener);
    assert_eq!(consumer.target_layers(), (0, 2));
}

/// Provisional state never leaks across allocation rounds.
#[test]
fn test_provisional_state_resets_after_apply() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    assert_eq!(consumer.use_available_bitrate(500_000, false), 450_000);
    consumer.apply_layers(&mut listener);

    // With no provisional target, an upgrade attempt is a no-op.
    assert_eq!(consumer.increase_temporal_layer(10_000_000, false), 0);
}

#[test]
fn test_increase_temporal_layer_respects_preferred_ceiling() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    consumer
        .handle_request(
            ConsumerRequest::SetPreferredLayers(serde_json::json!({
                "spatialLayer": 0,
                "temporalLayer": 1,
            })),
            &mut listener,
        )
        .unwrap();

    assert_eq!(consumer.use_available_bitrate(500_000, false), 450_000);

    // Provisional already sits at the preferred (0,1); no upgrade allowed.
    assert_eq!(consumer.increase_temporal_layer(10_000_000, false), 0);
}

/// Heavy loss shrinks the virtual budget below the nominal one.
#[test]
fn test_heavy_loss_shrinks_virtual_budget() {
    let (mut consumer, _streams, _listener) = managed_consumer();

    // fraction_lost 52/256 is ~20.3% loss; the virtual budget becomes
    // (1 - 0.5 * 0.203) * 500k, about 449.2 kbps, just under temporal 1.
    consumer.send_stream_mut().set_fraction_lost(52);

    let consumed = consumer.use_available_bitrate(500_000, true);
    assert_eq!(consumed, 200_000);
}

/// What the consumer would like with no budget constraint: the best chain
/// across layers.
#[test]
fn test_get_desired_bitrate_reports_unconstrained_wish() {
    let (consumer, _streams, _listener) = managed_consumer();

    // Layer 0 tops out at 600 kbps, then layer 1 offers 700 kbps.
    assert_eq!(consumer.get_desired_bitrate(), 700_000);
}

/// When externally managed, a preference change asks the allocator to
/// re-plan instead of switching directly.
#[test]
fn test_layer_changes_defer_to_allocator() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    let before = listener.need_bitrate_change_count;

    consumer
        .handle_request(
            ConsumerRequest::SetPreferredLayers(serde_json::json!({ "spatialLayer": 0 })),
            &mut listener,
        )
        .unwrap();

    assert_eq!(listener.need_bitrate_change_count, before + 1);
    // No direct target change happened.
    assert_eq!(consumer.target_layers(), (-1, -1));
}

/// A key-frame-gated spatial switch still works under external management:
/// the allocator applies layers, the consumer waits for the key frame.
#[test]
fn test_managed_switch_waits_for_key_frame() {
    let (mut consumer, _streams, mut listener) = managed_consumer();

    consumer.use_available_bitrate(500_000, false);
    consumer.apply_layers(&mut listener);
    assert_eq!(consumer.target_layers(), (0, 1));

    consumer.send_rtp_packet(&mut media_packet(0, 50, 9000, false), &mut listener);
    assert!(listener.sent.is_empty());

    consumer.send_rtp_packet(&mut media_packet(0, 51, 12000, true), &mut listener);
    assert_eq!(listener.sent.len(), 1);
    assert_eq!(consumer.current_spatial_layer(), 0);
}
