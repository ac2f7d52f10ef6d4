use notary::error::RegistryError;

use crate::{MockCandidates, MockChain, produce_blocks, running_notary, settle};

fn unavailable() -> RegistryError {
    RegistryError::ChainUnavailable("connection reset".to_owned())
}

#[tokio::test(start_paused = true)]
async fn failed_subscription_is_retried() {
    let chain = MockChain::deposited();
    chain.fail_next_subscription(unavailable());
    let candidates = MockCandidates::new();

    let mut notary = running_notary(&chain, &candidates).await;

    assert_eq!(chain.subscribe_calls(), 2);
    // The first working subscription is not a resubscription, so there is nothing to catch up on.
    assert_eq!(chain.current_block_calls(), 0);

    produce_blocks(&chain, [10]).await;
    assert_eq!(chain.sampled_periods(), vec![2]);
    notary.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn errored_stream_is_resubscribed() {
    let chain = MockChain::deposited();
    let candidates = MockCandidates::new();
    let mut notary = running_notary(&chain, &candidates).await;

    produce_blocks(&chain, [10]).await;
    chain.break_subscription(unavailable());
    chain.wait_for_subscriptions(2).await;
    settle().await;

    assert_eq!(chain.current_block_calls(), 1);
    // Catching up to block 10 again emits nothing new.
    assert_eq!(chain.sampled_periods(), vec![2]);

    produce_blocks(&chain, [15]).await;
    assert_eq!(chain.sampled_periods(), vec![2, 3]);
    notary.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_catch_up_resumes_on_next_header() {
    let chain = MockChain::deposited();
    let candidates = MockCandidates::new();
    let mut notary = running_notary(&chain, &candidates).await;

    produce_blocks(&chain, [15]).await;
    chain.fail_next_current_block(unavailable());
    chain.disconnect();
    chain.advance_silently(30);
    chain.wait_for_subscriptions(2).await;
    settle().await;

    assert_eq!(chain.current_block_calls(), 1);
    assert_eq!(chain.sampled_periods(), vec![3]);

    produce_blocks(&chain, [31]).await;
    assert_eq!(chain.sampled_periods(), vec![3, 4, 5, 6]);
    notary.stop().await.unwrap();
}
