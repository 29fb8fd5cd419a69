//! End-to-end reconciliation tests against the in-memory chain
//!
//! Each test wires the real components (ledger store, dispatcher, ingestor,
//! tracker) to a scripted MockChain and drives them by calling the same
//! entry points the background loops call.

use std::sync::Arc;

use campaign_ledger::chain::mock::{MockChain, MockSigner};
use campaign_ledger::db::campaigns::{self, CampaignStatus, CreateCampaignInput};
use campaign_ledger::db::commands::{self, CommandStatus};
use campaign_ledger::db::withdrawals::{self, WithdrawalStatus};
use campaign_ledger::db::audit::{self, AuditQuery};
use campaign_ledger::error::LedgerError;
use campaign_ledger::stats;
use campaign_ledger::{
    CommandDispatcher, EventIngestor, IngestorConfig, LedgerDb, TrackerConfig, TransactionTracker,
};

const DEPTH: u64 = 6;

struct Harness {
    db: Arc<LedgerDb>,
    chain: Arc<MockChain>,
    dispatcher: Arc<CommandDispatcher>,
    ingestor: EventIngestor,
    tracker: Arc<TransactionTracker>,
}

fn harness(receipt_wait_window_secs: u64) -> Harness {
    let db = Arc::new(LedgerDb::open_in_memory().unwrap());
    let chain = Arc::new(MockChain::new());
    let dispatcher = Arc::new(CommandDispatcher::new(db.clone()));
    let ingestor = EventIngestor::new(
        db.clone(),
        chain.clone(),
        dispatcher.clone(),
        IngestorConfig {
            confirmation_depth: DEPTH,
            start_block: 0,
            min_disburse_amount: 0.01,
        },
    );
    let tracker = Arc::new(TransactionTracker::new(
        db.clone(),
        chain.clone(),
        Arc::new(MockSigner),
        TrackerConfig {
            submit_workers: 2,
            submit_lease_secs: 30,
            receipt_poll_interval_secs: 1,
            receipt_wait_window_secs,
            sweep_interval_secs: 1,
            sweep_hard_cutoff_secs: 0,
        },
    ));
    Harness {
        db,
        chain,
        dispatcher,
        ingestor,
        tracker,
    }
}

fn campaign_input(auto_disburse: bool, threshold: f64) -> CreateCampaignInput {
    CreateCampaignInput {
        title: "Flood Relief".into(),
        short_desc: None,
        description: Some("Emergency response".into()),
        image_url: None,
        beneficiary_address: Some("0xbeef".into()),
        target_amount: 10.0,
        currency: "ETH".into(),
        deadline: None,
        auto_disburse,
        disburse_threshold: threshold,
        create_onchain: true,
    }
}

const ETH: u128 = 1_000_000_000_000_000_000;

/// Create a campaign on-chain through the real dispatcher + tracker path
async fn create_active_campaign(h: &Harness, input: &CreateCampaignInput) -> i64 {
    h.chain.set_auto_receipt(true);
    let created = h.dispatcher.create_campaign(input, "admin").unwrap();
    h.tracker.submit_once().await.unwrap();
    h.tracker.poll_submitted_once().await.unwrap();
    h.chain.set_auto_receipt(false);

    let campaign = h
        .db
        .with_conn(|conn| campaigns::get_campaign(conn, created.campaign.id))
        .unwrap()
        .unwrap();
    assert_eq!(campaign.status, CampaignStatus::Active);
    assert!(campaign.onchain_id.is_some());
    created.campaign.id
}

#[tokio::test]
async fn donations_flow_from_chain_into_stats() {
    let h = harness(60);
    let id = create_active_campaign(&h, &campaign_input(false, 0.8)).await;
    let onchain = 1;

    h.chain.push_donation(onchain, "0xaaa", 2 * ETH, "0xd1", 0, 10);
    h.chain.push_donation(onchain, "0xbbb", 3 * ETH, "0xd2", 0, 11);
    h.chain.push_donation(onchain, "0xaaa", ETH / 2, "0xd2", 1, 11);
    h.chain.set_head(11 + DEPTH);

    let result = h.ingestor.ingest_once().await.unwrap();
    assert_eq!(result.donations_added, 3);
    assert_eq!(result.new_cursor, 11);

    let s = h.db.with_conn(|conn| stats::campaign_stats(conn, id)).unwrap();
    assert_eq!(s.total_raised, 5.5);
    assert_eq!(s.donor_count, 2);
    assert_eq!(s.donation_count, 3);
    assert_eq!(s.available, 5.5);
    assert!((s.progress - 0.55).abs() < 1e-9);
}

#[tokio::test]
async fn replaying_a_batch_changes_nothing() {
    let h = harness(60);
    let id = create_active_campaign(&h, &campaign_input(false, 0.8)).await;

    h.chain.push_donation(1, "0xaaa", 2 * ETH, "0xd1", 0, 10);
    h.chain.set_head(10 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();

    // the same range replays after a simulated crash before the cursor
    // advance: rows are absorbed, totals unchanged
    h.db.with_conn(|conn| campaign_ledger::db::cursor::set(conn, 5, None))
        .unwrap();
    let replay = h.ingestor.ingest_once().await.unwrap();
    assert_eq!(replay.donations_added, 0);
    assert_eq!(replay.duplicates, 1);

    let s = h.db.with_conn(|conn| stats::campaign_stats(conn, id)).unwrap();
    assert_eq!(s.total_raised, 2.0);
    assert_eq!(s.donation_count, 1);
}

#[tokio::test]
async fn donation_for_unknown_campaign_is_skipped_not_fatal() {
    let h = harness(60);
    let id = create_active_campaign(&h, &campaign_input(false, 0.8)).await;

    h.chain.push_donation(99, "0xaaa", ETH, "0xu1", 0, 10);
    h.chain.push_donation(1, "0xaaa", ETH, "0xd1", 0, 10);
    h.chain.set_head(10 + DEPTH);

    let result = h.ingestor.ingest_once().await.unwrap();
    assert_eq!(result.skipped, 1);
    assert_eq!(result.donations_added, 1);
    assert_eq!(result.new_cursor, 10);

    let s = h.db.with_conn(|conn| stats::campaign_stats(conn, id)).unwrap();
    assert_eq!(s.total_raised, 1.0);
}

#[tokio::test]
async fn withdraw_settles_and_observed_event_is_absorbed() {
    let h = harness(60);
    let id = create_active_campaign(&h, &campaign_input(false, 0.8)).await;

    h.chain.push_donation(1, "0xaaa", 5 * ETH, "0xd1", 0, 10);
    h.chain.set_head(10 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();

    h.chain.set_auto_receipt(true);
    h.dispatcher.submit_withdraw(id, 3.0, "admin").unwrap();
    h.tracker.submit_once().await.unwrap();
    h.tracker.poll_submitted_once().await.unwrap();

    let rows = h
        .db
        .with_conn(|conn| withdrawals::list_for_campaign(conn, id))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, WithdrawalStatus::Confirmed);
    let withdraw_tx = rows[0].tx_hash.clone().unwrap();

    // the ingestor later observes the same withdrawal in a contract log;
    // the tx hash keys it to the existing row instead of creating another
    h.chain.push_event(campaign_ledger::chain::ChainEvent::Withdrawal {
        onchain_campaign_id: 1,
        owner: "0xbeef".into(),
        amount_wei: 3 * ETH,
        tx_hash: withdraw_tx,
        log_index: 0,
        block_number: 17,
    });
    h.chain.set_head(17 + DEPTH);
    let result = h.ingestor.ingest_once().await.unwrap();
    assert_eq!(result.withdrawals_added, 0);
    assert_eq!(result.duplicates, 1);

    let s = h.db.with_conn(|conn| stats::campaign_stats(conn, id)).unwrap();
    assert_eq!(s.total_withdrawn, 3.0);
    assert_eq!(s.available, 2.0);
}

#[tokio::test]
async fn auto_disburse_fires_once_per_threshold_crossing() {
    let h = harness(60);
    let id = create_active_campaign(&h, &campaign_input(true, 0.8)).await;

    // 7 ETH of 10: below threshold, nothing dispatched
    h.chain.push_donation(1, "0xaaa", 7 * ETH, "0xd1", 0, 10);
    h.chain.set_head(10 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();
    assert!(h
        .db
        .with_conn(|conn| withdrawals::list_for_campaign(conn, id))
        .unwrap()
        .is_empty());

    // crossing 80% dispatches one full-balance withdrawal by the system actor
    h.chain.push_donation(1, "0xbbb", 2 * ETH, "0xd2", 0, 12);
    h.chain.set_head(12 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();

    let rows = h
        .db
        .with_conn(|conn| withdrawals::list_for_campaign(conn, id))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, 9.0);
    assert_eq!(rows[0].requested_by, "system:auto_disburse");

    // more donations while the command is in flight do not stack another
    h.chain.push_donation(1, "0xccc", ETH, "0xd3", 0, 14);
    h.chain.set_head(14 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();
    let rows = h
        .db
        .with_conn(|conn| withdrawals::list_for_campaign(conn, id))
        .unwrap();
    assert_eq!(rows.len(), 1);

    // settle it; the next crossing considers only the remaining balance
    h.chain.set_auto_receipt(true);
    h.tracker.submit_once().await.unwrap();
    h.tracker.poll_submitted_once().await.unwrap();
    h.chain.set_auto_receipt(false);

    h.chain.push_donation(1, "0xddd", ETH, "0xd4", 0, 16);
    h.chain.set_head(16 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();

    let rows = h
        .db
        .with_conn(|conn| withdrawals::list_for_campaign(conn, id))
        .unwrap();
    assert_eq!(rows.len(), 2);
    // 11 raised, 9 withdrawn; newest row first
    assert_eq!(rows[0].amount, 2.0);
}

#[tokio::test]
async fn racing_withdraws_cannot_overdraw() {
    let h = harness(60);
    let id = create_active_campaign(&h, &campaign_input(false, 0.8)).await;

    h.chain.push_donation(1, "0xaaa", 5 * ETH, "0xd1", 0, 10);
    h.chain.set_head(10 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();

    h.dispatcher.submit_withdraw(id, 4.0, "admin").unwrap();
    let second = h.dispatcher.submit_withdraw(id, 4.0, "admin");
    assert!(matches!(second, Err(LedgerError::CommandInFlight { .. })));

    // settle the first, then the balance check rejects the repeat
    h.chain.set_auto_receipt(true);
    h.tracker.submit_once().await.unwrap();
    h.tracker.poll_submitted_once().await.unwrap();

    let third = h.dispatcher.submit_withdraw(id, 4.0, "admin");
    assert!(matches!(third, Err(LedgerError::InvalidCommand(_))));
    h.dispatcher.submit_withdraw(id, 1.0, "admin").unwrap();
}

#[tokio::test]
async fn unresolved_command_stays_unknown_until_receipt_settles_it() {
    let h = harness(0);
    h.chain.set_auto_receipt(true);
    let created = h.dispatcher.create_campaign(&campaign_input(false, 0.8), "admin").unwrap();
    h.tracker.submit_once().await.unwrap();
    h.tracker.poll_submitted_once().await.unwrap();
    h.chain.set_auto_receipt(false);
    let id = created.campaign.id;

    h.chain.push_donation(1, "0xaaa", 5 * ETH, "0xd1", 0, 10);
    h.chain.set_head(10 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();

    // submit a withdraw whose receipt never arrives inside the window
    let command_id = h.dispatcher.submit_withdraw(id, 2.0, "admin").unwrap();
    h.tracker.submit_once().await.unwrap();
    h.tracker.poll_submitted_once().await.unwrap();

    let command = h
        .db
        .with_conn(|conn| commands::get_command(conn, command_id))
        .unwrap()
        .unwrap();
    assert_eq!(command.status, CommandStatus::Unknown);
    let rows = h
        .db
        .with_conn(|conn| withdrawals::list_for_campaign(conn, id))
        .unwrap();
    assert_eq!(rows[0].status, WithdrawalStatus::Unknown);

    let unknown_entries = h
        .db
        .with_conn(|conn| {
            audit::list(
                conn,
                &AuditQuery {
                    action: Some("command_unknown".into()),
                    ..Default::default()
                },
            )
        })
        .unwrap();
    assert_eq!(unknown_entries.len(), 1);

    // the transaction was mined after all; the sweep promotes everything
    let tx_hash = command.tx_hash.unwrap();
    h.chain.deliver_receipt(&tx_hash, true, None);
    h.tracker.sweep_unknown_once().await.unwrap();

    let command = h
        .db
        .with_conn(|conn| commands::get_command(conn, command_id))
        .unwrap()
        .unwrap();
    assert_eq!(command.status, CommandStatus::Confirmed);
    let rows = h
        .db
        .with_conn(|conn| withdrawals::list_for_campaign(conn, id))
        .unwrap();
    assert_eq!(rows[0].status, WithdrawalStatus::Confirmed);

    let s = h.db.with_conn(|conn| stats::campaign_stats(conn, id)).unwrap();
    assert_eq!(s.total_withdrawn, 2.0);
}

#[tokio::test]
async fn reorg_rolls_back_and_recovery_is_idempotent() {
    let h = harness(60);
    let id = create_active_campaign(&h, &campaign_input(false, 0.8)).await;

    h.chain.push_donation(1, "0xaaa", 2 * ETH, "0xd1", 0, 10);
    h.chain.set_head(10 + DEPTH);
    h.ingestor.ingest_once().await.unwrap();

    // the block at the cursor is replaced
    h.chain.set_block_hash(10, "0xforked");
    h.chain.set_head(20 + DEPTH);
    let result = h.ingestor.ingest_once().await.unwrap();
    assert!(result.reorg_detected);
    assert_eq!(result.new_cursor, 10 - DEPTH);

    let conflicts = h
        .db
        .with_conn(|conn| {
            audit::list(
                conn,
                &AuditQuery {
                    action: Some("reconciliation_conflict".into()),
                    ..Default::default()
                },
            )
        })
        .unwrap();
    assert_eq!(conflicts.len(), 1);

    // the next pass replays the range; surviving events are duplicates
    let replay = h.ingestor.ingest_once().await.unwrap();
    assert!(!replay.reorg_detected);
    assert_eq!(replay.donations_added, 0);
    assert_eq!(replay.duplicates, 1);

    let s = h.db.with_conn(|conn| stats::campaign_stats(conn, id)).unwrap();
    assert_eq!(s.total_raised, 2.0);
}
