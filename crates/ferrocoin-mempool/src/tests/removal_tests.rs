//! Block connection, conflicts, reorgs and estimator interaction.

use super::*;
use crate::types::RemovalReason;

#[test]
fn test_remove_for_block_updates_survivors() {
    let mut pool = test_pool();
    let (estimator, events) = RecordingEstimator::new();
    pool.set_estimator(Box::new(estimator));

    let txs = add_chain(&mut pool, 0, &[1000, 2000]);
    let parent_txid = txs[0].compute_txid();
    let child_txid = txs[1].compute_txid();
    pool.prioritise_transaction(&parent_txid, 700);

    pool.remove_for_block(&[txs[0].clone()], 2, 100);

    assert_not_in_pool(&pool, &parent_txid);
    assert_in_pool(&pool, &child_txid);

    // The survivor no longer counts the confirmed parent as an ancestor.
    let child = pool.get_entry(&child_txid).unwrap();
    assert_eq!(child.count_with_ancestors(), 1);
    assert_eq!(child.size_with_ancestors(), child.tx_size());
    assert_eq!(child.mod_fees_with_ancestors(), 2000);
    assert!(child.parents.is_empty());

    // Confirmation clears the prioritisation.
    assert_eq!(pool.apply_delta(&parent_txid), 0);

    let events = events.lock().unwrap();
    assert!(events.contains(&EstimatorEvent::Transaction(parent_txid, true)));
    assert!(events.contains(&EstimatorEvent::Block(2, vec![parent_txid])));
    assert!(events.contains(&EstimatorEvent::Removed(parent_txid, false)));
}

#[test]
fn test_remove_conflicts() {
    let mut pool = test_pool();
    let txs = add_chain(&mut pool, 0, &[1000, 2000]);

    // A confirmed transaction double-spends the chain's funding outpoint.
    let replacement = TxBuilder::new().input(funding_outpoint(0)).output(95_000).build();
    pool.remove_conflicts(&replacement);

    assert_eq!(pool.size(), 0);
    assert_not_in_pool(&pool, &txs[0].compute_txid());
    assert_not_in_pool(&pool, &txs[1].compute_txid());
}

#[test]
fn test_conflict_removal_via_block_clears_prioritisation() {
    let mut pool = test_pool();
    let txs = add_chain(&mut pool, 0, &[1000]);
    let conflicted_txid = txs[0].compute_txid();
    pool.prioritise_transaction(&conflicted_txid, 300);

    let replacement = TxBuilder::new().input(funding_outpoint(0)).output(95_000).build();
    pool.remove_for_block(&[replacement.clone()], 3, 100);

    assert_not_in_pool(&pool, &conflicted_txid);
    assert_eq!(pool.apply_delta(&conflicted_txid), 0);
}

#[test]
fn test_reorg_reinsertion_round_trip() {
    let mut pool = test_pool();
    let txs = add_chain(&mut pool, 0, &[1000, 2000, 3000]);
    let txids: Vec<Txid> = txs.iter().map(|tx| tx.compute_txid()).collect();

    let snapshot = |pool: &MemPoolInner| -> Vec<(u64, i64, i64, u64, i64, i64)> {
        txids
            .iter()
            .map(|txid| {
                let entry = pool.get_entry(txid).unwrap();
                (
                    entry.count_with_ancestors(),
                    entry.size_with_ancestors(),
                    entry.mod_fees_with_ancestors(),
                    entry.count_with_descendants(),
                    entry.size_with_descendants(),
                    entry.mod_fees_with_descendants(),
                )
            })
            .collect()
    };
    let before = snapshot(&pool);

    pool.remove_for_block(&txs, 2, 100);
    assert_eq!(pool.size(), 0);

    for (tx, fee) in txs.iter().zip([1000u64, 2000, 3000]) {
        pool.add_unchecked(test_entry(tx, fee), true);
    }
    assert_eq!(snapshot(&pool), before);
}

/// A disconnected block's transaction is re-added under an in-pool child;
/// the repair pass restores the severed links and rollups.
#[test]
fn test_update_transactions_from_block() {
    let mut pool = test_pool();
    let view = MockCoinsView::new();
    view.add_coin(funding_outpoint(0), 1_000_000, 1, false);

    let parent = TxBuilder::new().input(funding_outpoint(0)).output(99_000).build();
    let parent_txid = parent.compute_txid();
    let child = TxBuilder::new()
        .input(OutPoint::new(parent_txid, 0))
        .output(98_000)
        .build();
    let child_txid = child.compute_txid();

    // While the parent was confirmed, only the child lived in the pool.
    pool.add_unchecked(test_entry(&child, 1000), true);
    assert_eq!(pool.get_entry(&child_txid).unwrap().count_with_ancestors(), 1);

    // The block is disconnected: the parent re-enters with no children
    // linked, then the repair pass runs over the disconnected hashes.
    pool.add_unchecked(test_entry(&parent, 500), true);
    pool.update_transactions_from_block(&[parent_txid]);

    let parent_entry = pool.get_entry(&parent_txid).unwrap();
    let child_entry = pool.get_entry(&child_txid).unwrap();
    assert_eq!(parent_entry.count_with_descendants(), 2);
    assert_eq!(
        parent_entry.mod_fees_with_descendants(),
        500 + 1000
    );
    assert_eq!(child_entry.count_with_ancestors(), 2);
    assert_eq!(
        child_entry.size_with_ancestors(),
        parent_entry.tx_size() + child_entry.tx_size()
    );

    pool.check_internal(&view);
}

#[test]
fn test_remove_for_reorg_nonfinal_and_descendants() {
    let mut pool = test_pool();
    let view = MockCoinsView::new();
    view.add_coin(funding_outpoint(0), 1_000_000, 1, false);
    view.add_coin(funding_outpoint(1), 1_000_000, 1, false);

    let txs = add_chain(&mut pool, 0, &[1000, 2000]);
    let keeper = TxBuilder::new().input(funding_outpoint(1)).output(99_000).build();
    pool.add_unchecked(test_entry(&keeper, 1000), true);

    let mut oracle = TestOracle::permissive();
    oracle.non_final.insert(txs[0].compute_txid());
    pool.remove_for_reorg(&view, &oracle, 100, 0);

    // The non-final root and its descendant go; the keeper stays.
    assert_not_in_pool(&pool, &txs[0].compute_txid());
    assert_not_in_pool(&pool, &txs[1].compute_txid());
    assert_in_pool(&pool, &keeper.compute_txid());
}

#[test]
fn test_remove_for_reorg_immature_coinbase_spend() {
    let mut pool = test_pool();
    let view = MockCoinsView::new();
    // Coinbase coin created at height 95; at mempool height 100 it is far
    // from mature.
    view.add_coin(funding_outpoint(0), 1_000_000, 95, true);
    view.add_coin(funding_outpoint(1), 1_000_000, 1, false);

    let spender = TxBuilder::new().input(funding_outpoint(0)).output(99_000).build();
    pool.add_unchecked(
        crate::TxMemPoolEntry::new(
            spender.clone(),
            Amount::from_sat(1000),
            0,
            95,
            true,
            0,
            crate::LockPoints::default(),
        ),
        true,
    );
    let keeper = TxBuilder::new().input(funding_outpoint(1)).output(99_000).build();
    pool.add_unchecked(test_entry(&keeper, 1000), true);

    let oracle = TestOracle::permissive();
    pool.remove_for_reorg(&view, &oracle, 100, 0);

    assert_not_in_pool(&pool, &spender.compute_txid());
    assert_in_pool(&pool, &keeper.compute_txid());
}

#[test]
fn test_remove_recursive_of_absent_parent_removes_children() {
    let mut pool = test_pool();
    let parent = TxBuilder::new().input(funding_outpoint(0)).output(99_000).build();
    let child = TxBuilder::new()
        .input(OutPoint::new(parent.compute_txid(), 0))
        .output(98_000)
        .build();
    let grandchild = TxBuilder::new()
        .input(OutPoint::new(child.compute_txid(), 0))
        .output(97_000)
        .build();

    // Mid-reorg: the parent was not re-accepted, but its descendants are
    // still resident.
    pool.add_unchecked(test_entry(&child, 1000), true);
    pool.add_unchecked(test_entry(&grandchild, 1000), true);

    pool.remove_recursive(&parent, RemovalReason::Reorg);
    assert_eq!(pool.size(), 0);
}

#[test]
fn test_clear_preserves_deltas() {
    let mut pool = test_pool();
    let txs = add_chain(&mut pool, 0, &[1000]);
    let txid = txs[0].compute_txid();
    pool.prioritise_transaction(&txid, 250);

    pool.clear(50);
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.total_tx_size(), 0);
    // Deltas have pool lifetime and survive a clear.
    assert_eq!(pool.apply_delta(&txid), 250);

    pool.add_unchecked(test_entry(&txs[0], 1000), true);
    assert_eq!(pool.get_entry(&txid).unwrap().modified_fee(), 1250);
}
