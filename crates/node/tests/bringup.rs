mod common;

use common::{harness, FakeContract, REWARD_AMOUNT};
use sndevnet::bridge::CrossChainBridge;
use sndevnet::contract::RewardsContract;
use sndevnet::error::DevnetError;
use sndevnet::network::ATTACH_BLOCKS;
use sndevnet::registration::RegistrationWorkflow;
use sndevnet_consensus::{min_registration_height, COIN};
use sndevnet_primitives::U256;
use sndevnet_servicenode::{BridgeStage, NodeStage};

#[test]
fn five_solo_nodes_register_and_propagate_bls_keys() {
    let h = harness(5, 3, 0);
    let mut workflow = RegistrationWorkflow::new(&h.network);
    workflow.run().unwrap();

    assert_eq!(h.chain.registered(), 5);
    assert!(workflow
        .stages()
        .iter()
        .all(|stage| *stage == NodeStage::ProofPropagated));
    // 46 to fund the first round, then one block each side of the proofs.
    assert_eq!(h.chain.height(), 48);
    for node in h.network.service_nodes() {
        let states = node.api().service_node_states().unwrap();
        assert_eq!(states.len(), 5);
        assert!(states
            .iter()
            .all(|entry| entry.pubkey_bls.as_deref().is_some_and(|key| !key.is_empty())));
        assert!(node.cached_height() >= 48);
    }
}

#[test]
fn mining_is_polled_until_the_daemon_stops() {
    let h = harness(5, 3, 0);
    h.chain.mine_gradually(None);
    let reward = h.network.params().block_reward;

    let height = h.network.mine(h.network.mike(), 4).unwrap();
    assert_eq!(height, 4);
    assert_eq!(h.chain.height(), 4);
    // One poll per block while active, then the poll that sees it stop.
    assert_eq!(h.chain.mining_polls(), 5);
    assert_eq!(h.chain.balance("addr-Mike"), 4 * reward);
}

#[test]
fn mining_that_stops_early_returns_the_height_reached() {
    let h = harness(5, 3, 0);
    h.chain.set_height(10);
    h.chain.mine_gradually(Some(2));
    let height = h.network.mine(h.network.mike(), 6).unwrap();
    assert_eq!(height, 12);
    assert_eq!(h.chain.mining_polls(), 3);
}

#[test]
fn registration_needs_the_minimum_height() {
    let h = harness(5, 3, 0);
    let params = h.network.params().clone();
    let required = min_registration_height(&params, 1);
    assert_eq!(required, 40);
    h.chain.credit("addr-Mike", 500 * COIN);

    let mut workflow = RegistrationWorkflow::new(&h.network);
    h.chain.set_height(required - 1);
    let err = workflow.register_solo(h.network.mike(), 0).unwrap_err();
    assert!(
        matches!(err, DevnetError::InsufficientOutputs { ref wallet, .. } if wallet == "Mike"),
        "{err}"
    );
    assert_eq!(workflow.stage(0), Some(NodeStage::Unfunded));

    h.chain.set_height(required);
    workflow.register_solo(h.network.mike(), 0).unwrap();
    assert_eq!(workflow.stage(0), Some(NodeStage::AwaitingMaturity));
    assert_eq!(h.chain.balance("addr-Mike"), 400 * COIN);
}

#[test]
fn second_registration_on_one_node_is_rejected() {
    let h = harness(5, 3, 0);
    h.chain.credit("addr-Mike", 500 * COIN);
    h.chain.set_height(60);
    let mut workflow = RegistrationWorkflow::new(&h.network);
    workflow.register_solo(h.network.mike(), 2).unwrap();
    let err = workflow.register_solo(h.network.mike(), 2).unwrap_err();
    assert!(matches!(err, DevnetError::StateMismatch { .. }), "{err}");
}

#[test]
fn full_network_registers_seeds_and_claims() {
    let h = harness(12, 3, 9);
    let mut workflow = RegistrationWorkflow::new(&h.network);
    workflow.run().unwrap();

    // The last service node is operated by Bob and filled by nine
    // contributors.
    let open = workflow.registration(11).unwrap();
    assert_eq!(open.contributors.len(), 10);
    assert_eq!(open.contributors[0].amount, 28 * COIN);
    assert_eq!(open.total(), 100 * COIN);
    let solo = workflow.registration(0).unwrap();
    assert_eq!(solo.contributors.len(), 1);

    let contract = FakeContract::new();
    let mut bridge = CrossChainBridge::new(&h.network, &contract).unwrap();
    bridge.seed().unwrap();
    assert_eq!(bridge.seeded(), 12);
    assert_eq!(contract.total_nodes().unwrap(), 12);
    assert!(contract.is_started());
    for entry in contract.seeded_entries() {
        let total = entry
            .contributors
            .iter()
            .fold(U256::ZERO, |acc, contributor| acc + contributor.staked_amount);
        assert_eq!(total, contract.contract_requirement());
    }

    bridge.register_key().unwrap();
    assert_eq!(contract.total_nodes().unwrap(), 13);
    assert_eq!(contract.advanced(), 3);
    assert_eq!(bridge.stage(), BridgeStage::KeyRegistered);

    let before = h.network.bridge().unwrap().cached_height();
    bridge.wait_pulse().unwrap();
    assert!(h.network.bridge().unwrap().cached_height() >= before + 2);
    assert_eq!(bridge.stage(), BridgeStage::PulseObserved);

    let claim = bridge.request_rewards().unwrap().clone();
    assert_eq!(claim.amount, U256::from(REWARD_AMOUNT));
    let account = contract.funding_account();
    assert_eq!(contract.recipient(&account).unwrap().claimed, U256::ZERO);

    let claimed = bridge.claim_rewards().unwrap();
    assert_eq!(claimed.claimed, U256::from(REWARD_AMOUNT));
    assert!(claimed.available().is_zero());
    assert_eq!(contract.token_balance(&account), U256::from(REWARD_AMOUNT));
    assert_eq!(bridge.stage(), BridgeStage::RewardsClaimed);
}

#[test]
fn bridge_steps_run_in_order() {
    let h = harness(5, 3, 0);
    let contract = FakeContract::new();
    let mut bridge = CrossChainBridge::new(&h.network, &contract).unwrap();
    assert!(bridge.register_key().is_err());
    assert!(bridge.claim_rewards().is_err());
    assert_eq!(bridge.stage(), BridgeStage::Unseeded);
    assert_eq!(contract.total_nodes().unwrap(), 0);
}

#[test]
fn unregistered_nodes_cannot_be_seeded() {
    let h = harness(5, 3, 0);
    let contract = FakeContract::new();
    let mut bridge = CrossChainBridge::new(&h.network, &contract).unwrap();
    let err = bridge.seed().unwrap_err();
    assert!(matches!(err, DevnetError::StateMismatch { .. }), "{err}");
    assert!(!contract.is_started());
}

#[test]
fn attach_prepares_another_round() {
    let h = harness(5, 3, 0);
    RegistrationWorkflow::new(&h.network).run().unwrap();
    let height = h.chain.height();
    let alice = h.network.alice().address().unwrap();

    h.network.attach().unwrap();
    assert_eq!(h.chain.flushes(), h.network.nodes().len());
    assert_eq!(h.chain.height(), height + ATTACH_BLOCKS);
    assert_ne!(h.network.alice().address().unwrap(), alice);
    assert_eq!(h.network.alice().balances().unwrap().total, 0);
}
