// Copyright 2026 The Tessera Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod helper;

use std::time::Duration;

use prost::Message;
use tessera_api::v1::{
    envelope::Payload, CacheChangeBatch, CustomMessage, Envelope, PartitionState, SingleMessage,
    TopologyVersion,
};
use tessera_server::codec;

use crate::helper::cluster::TestCluster;

const GROUP: u64 = 1;

/// A joining server triggers a full two-phase round and every member
/// completes on the join version.
#[tokio::test(flavor = "multi_thread")]
async fn single_join_two_phase_round() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    assert_eq!(a.wait(&a_join).await, Ok(TopologyVersion::new(1, 0)));

    let (b, b_join) = cluster.join_server().await;
    assert_eq!(a.wait(&b_join).await, Ok(TopologyVersion::new(2, 0)));
    assert_eq!(b.wait(&b_join).await, Ok(TopologyVersion::new(2, 0)));

    // Seed data so the next decide step has owners to assign.
    a.seed_partition(GROUP, 0, PartitionState::Owning, 0, 10);
    a.seed_partition(GROUP, 1, PartitionState::Owning, 0, 20);

    let (c, c_join) = cluster.join_server().await;
    let res = TopologyVersion::new(3, 0);
    assert_eq!(a.wait(&c_join).await, Ok(res));
    assert_eq!(b.wait(&c_join).await, Ok(res));
    assert_eq!(c.wait(&c_join).await, Ok(res));

    // All participants converge onto the same topology version and the
    // same ownership view of the seeded partitions.
    for node in [&a, &b, &c] {
        let top = node.topology(GROUP);
        assert_eq!(top.topology().ready_version(), res);
        assert_eq!(
            top.topology().partition_state(a.id(), 0),
            PartitionState::Owning
        );
    }

    // The full messages the coordinator distributed are identical.
    let to_b = cluster.state.sent_full_messages(a.id(), b.id());
    let to_c = cluster.state.sent_full_messages(a.id(), c.id());
    let last_b = to_b.last().expect("full message to b");
    let last_c = to_c.last().expect("full message to c");
    assert_eq!(last_b.partitions, last_c.partitions);
    assert_eq!(last_b.update_counters, last_c.update_counters);
}

/// Scenario: the coordinator dies before collecting all single messages.
/// The next lowest-ordered survivor restores state from the others and
/// finishes everyone at the version of the leave event.
#[tokio::test(flavor = "multi_thread")]
async fn coordinator_dies_mid_exchange() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();
    let (b, b_join) = cluster.join_server().await;
    b.wait(&b_join).await.unwrap();
    let (c, c_join) = cluster.join_server().await;
    c.wait(&c_join).await.unwrap();

    // Nothing reaches the current coordinator from now on.
    cluster.drop_link(b.id(), a.id());
    cluster.drop_link(c.id(), a.id());
    cluster.drop_link(4, a.id());

    let (d, d_join) = cluster.join_server().await;
    assert_eq!(d_join.version(), TopologyVersion::new(4, 0));

    let a_left = cluster.leave(a.id(), true).await;
    assert_eq!(a_left.version(), TopologyVersion::new(5, 0));

    // B restores the exchange as the new coordinator and folds the leave
    // event into the round, so everyone completes at (5, 0).
    let res = TopologyVersion::new(5, 0);
    assert_eq!(b.wait(&d_join).await, Ok(res));
    assert_eq!(c.wait(&d_join).await, Ok(res));
    assert_eq!(d.wait(&d_join).await, Ok(res));

    assert_eq!(b.wait(&a_left).await, Ok(res));
    assert_eq!(c.wait(&a_left).await, Ok(res));
    assert_eq!(d.wait(&a_left).await, Ok(res));
}

/// Scenario: the only owner of a partition fails. The partition is marked
/// LOST, the follow-up resend re-broadcasts the maps to the survivors, and
/// an operator reset clears the LOST state everywhere.
#[tokio::test(flavor = "multi_thread")]
async fn lost_partition_detected_and_reset() {
    let cluster = TestCluster::new(vec![(GROUP, 2)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();
    let (b, b_join) = cluster.join_server().await;
    a.wait(&b_join).await.unwrap();
    b.wait(&b_join).await.unwrap();

    let (c, c_join) = cluster
        .join_server_seeded(|node| {
            node.seed_partition(GROUP, 0, PartitionState::Owning, 0, 42);
        })
        .await;
    a.wait(&c_join).await.unwrap();
    c.wait(&c_join).await.unwrap();
    assert_eq!(
        a.topology(GROUP).topology().partition_state(c.id(), 0),
        PartitionState::Owning
    );

    let c_left = cluster.leave(c.id(), true).await;
    a.wait(&c_left).await.unwrap();
    b.wait(&c_left).await.unwrap();

    assert_eq!(a.topology(GROUP).topology().lost_partitions(), vec![0]);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if b.topology(GROUP).topology().lost_partitions() == vec![0] {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("lost partition not detected on the peer");

    // The scheduled follow-up actually re-broadcasts the map: the peer
    // receives a refresh full message carrying no exchange id.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let refreshed = cluster.state.sent.lock().unwrap().iter().any(|r| {
                r.from == a.id()
                    && r.to == b.id()
                    && matches!(
                        &r.envelope.payload,
                        Some(Payload::Full(m)) if m.exchange_id.is_none()
                    )
            });
            if refreshed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("partition map resend not observed");

    let reset = cluster
        .custom(
            a.id(),
            CustomMessage::CacheChange(CacheChangeBatch {
                reset_lost_groups: vec![GROUP],
                ..Default::default()
            }),
        )
        .await;
    a.wait(&reset).await.unwrap();
    b.wait(&reset).await.unwrap();
    assert!(a.topology(GROUP).topology().lost_partitions().is_empty());
    assert!(b.topology(GROUP).topology().lost_partitions().is_empty());
}

/// Scenario: a client joining is invisible to servers (no messaging) and
/// the client itself completes on a synthesized full message.
#[tokio::test(flavor = "multi_thread")]
async fn client_only_event() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();
    let (b, b_join) = cluster.join_server().await;
    b.wait(&b_join).await.unwrap();

    let singles_before = cluster.state.sent.lock().unwrap().len();

    let (x, x_join) = cluster.join_client().await;
    let res = TopologyVersion::new(3, 0);
    assert_eq!(a.wait(&x_join).await, Ok(res));
    assert_eq!(b.wait(&x_join).await, Ok(res));
    assert_eq!(x.wait(&x_join).await, Ok(res));

    // The servers exchanged nothing among themselves; only the client's
    // single message and its reply crossed the wire.
    let sent = cluster.state.sent.lock().unwrap();
    let new_msgs: Vec<_> = sent[singles_before..]
        .iter()
        .filter(|r| r.from != x.id() && r.to != x.id())
        .collect();
    assert!(new_msgs.is_empty(), "servers must not exchange messages");
}

/// Scenario: a second join arrives while the first is still collecting;
/// the coordinator folds both into one round.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_joins_merge_into_one_round() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();

    // B's single message to the coordinator is parked, keeping the join
    // exchange in its collect phase.
    cluster.hold_link(2, a.id());
    let (b, b_join) = cluster.join_server().await;
    let (c, c_join) = cluster.join_server().await;
    assert_eq!(b_join.version(), TopologyVersion::new(2, 0));
    assert_eq!(c_join.version(), TopologyVersion::new(3, 0));

    cluster.release_link(b.id(), a.id()).await;

    let res = TopologyVersion::new(3, 0);
    assert_eq!(a.wait(&b_join).await, Ok(res));
    assert_eq!(b.wait(&b_join).await, Ok(res));
    assert_eq!(c.wait(&c_join).await, Ok(res));
    assert_eq!(a.wait(&c_join).await, Ok(res));
}

/// A departed server with unique affinity forces distribution over the
/// discovery ring; every survivor applies the map at the same position.
#[tokio::test(flavor = "multi_thread")]
async fn centralized_affinity_distribution() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();
    let (b, b_join) = cluster.join_server().await;
    b.wait(&b_join).await.unwrap();
    let (c, c_join) = cluster.join_server().await;
    c.wait(&c_join).await.unwrap();

    cluster.set_centralized_on_left(true);
    let fulls_before = cluster.state.sent_full_messages(a.id(), b.id()).len();

    let c_left = cluster.leave(c.id(), true).await;
    let res = TopologyVersion::new(4, 0);
    assert_eq!(a.wait(&c_left).await, Ok(res));
    assert_eq!(b.wait(&c_left).await, Ok(res));

    // The full map travelled over the ring, not the transport.
    let fulls_after = cluster.state.sent_full_messages(a.id(), b.id()).len();
    assert_eq!(fulls_before, fulls_after);
}

/// A failed activation on one node fails the whole state change: the
/// errors map rides the full message and the finish notification reports
/// the cluster inactive.
#[tokio::test(flavor = "multi_thread")]
async fn state_change_failure_rolls_back() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();
    let (b, b_join) = cluster.join_server().await;
    b.wait(&b_join).await.unwrap();

    *b.lifecycle.activate_error.lock().unwrap() = Some("checkpoint corrupted".to_string());

    let change = cluster
        .custom(
            a.id(),
            CustomMessage::ChangeGlobalState {
                request_id: 7,
                activate: true,
            },
        )
        .await;

    assert!(a.wait(&change).await.is_err());
    assert!(b.wait(&change).await.is_err());

    // Both state managers saw the per-node errors and rolled back.
    assert!(!a.lifecycle.rollbacks.lock().unwrap().is_empty());
    assert!(!b.lifecycle.rollbacks.lock().unwrap().is_empty());

    // The finish notification reports the activation failed.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if a.lifecycle.finishes.lock().unwrap().contains(&(7, false)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state change finish not observed");
}

/// A single message arriving after the exchange finished is answered from
/// the retained finish state, re-stamped with the sender's exchange id.
#[tokio::test(flavor = "multi_thread")]
async fn late_single_message_replayed_from_finish_state() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();
    let (b, b_join) = cluster.join_server().await;
    b.wait(&b_join).await.unwrap();
    let (c, c_join) = cluster.join_server().await;
    c.wait(&c_join).await.unwrap();

    let fulls_before = cluster.state.sent_full_messages(a.id(), b.id()).len();

    // Replay B's single message for the long-finished join exchange.
    let late = SingleMessage {
        exchange_id: Some(b_join.clone()),
        last_version: 1,
        ..Default::default()
    };
    let payload = codec::encode(&Envelope::single(late));
    a.worker.on_message(b.id(), payload).await.unwrap();

    let fulls = cluster.state.sent_full_messages(a.id(), b.id());
    assert_eq!(fulls.len(), fulls_before + 1);
    let reply = fulls.last().unwrap();
    // Re-stamped with the late sender's exchange id, but carrying the
    // last decided state.
    assert_eq!(reply.exchange_id.as_ref(), Some(&b_join));
    let latest = cluster.state.sent_full_messages(a.id(), c.id());
    assert_eq!(
        reply.partitions,
        latest.last().unwrap().partitions,
        "late reply must carry the decided partition map"
    );
}

/// The quiesce waiter never gives up: a release future that outlives
/// several poll timeouts still lets the exchange finish.
#[tokio::test(flavor = "multi_thread")]
async fn quiesce_outlasts_release_future() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();

    // Three poll timeouts (2 * 100ms each) before the release completes.
    *a.tx_tracker.release_delay.lock().unwrap() = Duration::from_millis(650);

    let (b, b_join) = cluster.join_server().await;
    let res = TopologyVersion::new(2, 0);
    assert_eq!(a.wait(&b_join).await, Ok(res));
    assert_eq!(b.wait(&b_join).await, Ok(res));
}

/// Restore-state replies from peers that already finished carry the full
/// message, letting the new coordinator adopt the old outcome instead of
/// deciding again.
#[tokio::test(flavor = "multi_thread")]
async fn new_coordinator_adopts_finished_outcome() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();
    let (b, b_join) = cluster.join_server().await;
    b.wait(&b_join).await.unwrap();
    let (c, c_join) = cluster.join_server().await;
    c.wait(&c_join).await.unwrap();

    // B never hears the decision for D's join; C and D do.
    cluster.drop_link(a.id(), b.id());
    let (d, d_join) = cluster.join_server().await;

    let old_res = TopologyVersion::new(4, 0);
    assert_eq!(c.wait(&d_join).await, Ok(old_res));
    assert_eq!(d.wait(&d_join).await, Ok(old_res));

    let a_left = cluster.leave(a.id(), true).await;

    // B becomes coordinator, restores from C and D, and adopts the full
    // message they already applied: same result, no second decide.
    assert_eq!(b.wait(&d_join).await, Ok(old_res));

    // The follow-up leave exchange completes on every survivor.
    let res = TopologyVersion::new(5, 0);
    assert_eq!(b.wait(&a_left).await, Ok(res));
    assert_eq!(c.wait(&a_left).await, Ok(res));
    assert_eq!(d.wait(&a_left).await, Ok(res));
}

/// Decoded envelopes survive the worker round trip (wire sanity).
#[tokio::test(flavor = "multi_thread")]
async fn envelope_wire_round_trip() {
    let cluster = TestCluster::new(vec![(GROUP, 4)]);
    let (a, a_join) = cluster.join_server().await;
    a.wait(&a_join).await.unwrap();
    let (_b, b_join) = cluster.join_server().await;
    a.wait(&b_join).await.unwrap();

    let sent = cluster.state.sent.lock().unwrap();
    for record in sent.iter() {
        let bytes = match &record.envelope.payload {
            Some(Payload::Single(m)) => Envelope::single(m.clone()).encode_to_vec(),
            Some(Payload::Full(m)) => Envelope::full(m.clone()).encode_to_vec(),
            Some(Payload::SingleRequest(m)) => {
                Envelope::single_request(m.clone()).encode_to_vec()
            }
            None => continue,
        };
        let decoded = codec::decode(&bytes).unwrap();
        assert_eq!(decoded, record.envelope);
    }
}
