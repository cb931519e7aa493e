//! Self-contained example demonstrating aggregates, the repository, and a
//! checkpointed read model, all running against the in-memory event store.
//!
//! Run with: `cargo run --example bank_account`
//!
//! Nothing external is required; checkpoints land in a temporary directory.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use causeway_es::{
    AggregateState, CorrelationContext, DomainEvent, EventContext, EventProjector,
    EventSourcedEntity, EventStore, FileCheckpointStore, InMemoryEventStore, Repository,
    RepositoryError, SoftDeletable,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BankAccount aggregate
// ---------------------------------------------------------------------------

/// Domain events produced by the [`BankAccount`] aggregate.
///
/// Adjacently tagged serde serialization -- the required format for all
/// `causeway-es` domain events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum BankAccountEvent {
    Opened { owner: String },
    Deposited { amount: i64 },
    Withdrew { amount: i64 },
    Closed,
}

impl DomainEvent for BankAccountEvent {
    const TYPES: &'static [&'static str] = &["Opened", "Deposited", "Withdrew", "Closed"];
}

/// A bank account folded from its event stream.
#[derive(Debug, Clone, Default)]
struct BankAccount {
    owner: String,
    balance: i64,
    closed: bool,
}

impl AggregateState for BankAccount {
    const AGGREGATE_TYPE: &'static str = "bank-account";
    type Event = BankAccountEvent;

    fn apply(&mut self, event: &BankAccountEvent) {
        match event {
            BankAccountEvent::Opened { owner } => self.owner = owner.clone(),
            BankAccountEvent::Deposited { amount } => self.balance += amount,
            BankAccountEvent::Withdrew { amount } => self.balance -= amount,
            BankAccountEvent::Closed => self.closed = true,
        }
    }

    fn is_deleted(&self) -> bool {
        self.closed
    }
}

impl SoftDeletable for BankAccount {
    fn tombstone() -> BankAccountEvent {
        BankAccountEvent::Closed
    }
}

/// Errors a command handler can reject with.
#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("cannot withdraw {requested}: balance is {balance}")]
    InsufficientFunds { requested: i64, balance: i64 },
}

/// Command handling is plain code: decide against the folded state, then
/// raise the fact.
fn withdraw(
    account: &mut EventSourcedEntity<BankAccount>,
    amount: i64,
) -> Result<(), AccountError> {
    let balance = account.state().balance;
    if amount > balance {
        return Err(AccountError::InsufficientFunds {
            requested: amount,
            balance,
        });
    }
    account.raise(BankAccountEvent::Withdrew { amount });
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger totals read model (cross-account)
// ---------------------------------------------------------------------------

/// Sums activity across all accounts.
#[derive(Debug, Default)]
struct LedgerTotals {
    open_accounts: i64,
    deposited: i64,
    withdrawn: i64,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

/// Poll `condition` until it holds; a stalled consumer fails the run
/// instead of hanging it.
async fn wait_for(condition: impl Fn() -> bool) -> Result<(), tokio::time::error::Elapsed> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A real deployment keeps checkpoints across restarts; a temporary
    // directory keeps the example self-contained.
    let tmp = tempfile::tempdir()?;

    let store = InMemoryEventStore::new();
    let repository = Repository::new(store.clone());

    // Every request carries an identity chain; events raised while handling
    // it point back at it.
    let request = CorrelationContext::origin();

    let alice_id = Uuid::new_v4();
    let mut alice = EventSourcedEntity::<BankAccount>::fresh(alice_id);
    alice.set_source(request);
    alice.raise(BankAccountEvent::Opened {
        owner: "alice".to_owned(),
    });
    alice.raise(BankAccountEvent::Deposited { amount: 100 });
    withdraw(&mut alice, 30)?;
    repository.save(&mut alice).await?;

    let bob_id = Uuid::new_v4();
    let mut bob = EventSourcedEntity::<BankAccount>::fresh(bob_id);
    bob.raise(BankAccountEvent::Opened {
        owner: "bob".to_owned(),
    });
    bob.raise(BankAccountEvent::Deposited { amount: 50 });
    repository.save(&mut bob).await?;

    // Overdrafts are rejected before any event exists.
    let rejected = withdraw(&mut alice, 1_000).expect_err("overdraft must be rejected");
    println!("rejected: {rejected}");

    // Reload from the store: state is folded from events alone.
    let alice = repository.get_by_id::<BankAccount>(alice_id).await?;
    println!("{} = {}", alice.state().owner, alice.state().balance);
    assert_eq!(alice.state().balance, 70);
    assert_eq!(alice.version(), Some(2));

    // Each of alice's events belongs to the request's chain.
    let history = store.read_stream(alice_id, 0, u64::MAX).await?;
    assert!(
        history
            .iter()
            .all(|event| event.context.correlation_id() == request.correlation_id())
    );

    // Run the ledger read model as a checkpointed consumer.
    let totals = Arc::new(Mutex::new(LedgerTotals::default()));
    let sink = Arc::clone(&totals);
    let mut projector = EventProjector::new(store.clone(), FileCheckpointStore::new(tmp.path()));
    projector.subscribe(
        "ledger-totals",
        move |event: BankAccountEvent, _: EventContext| {
            let sink = Arc::clone(&sink);
            async move {
                let mut totals = sink.lock().unwrap_or_else(PoisonError::into_inner);
                match event {
                    BankAccountEvent::Opened { .. } => totals.open_accounts += 1,
                    BankAccountEvent::Deposited { amount } => totals.deposited += amount,
                    BankAccountEvent::Withdrew { amount } => totals.withdrawn += amount,
                    BankAccountEvent::Closed => totals.open_accounts -= 1,
                }
                Ok(())
            }
        },
    );
    projector.start("ledger-totals")?;
    wait_for(|| projector.is_caught_up("ledger-totals")).await?;

    // Close bob's account while the consumer tails live events.
    let mut bob = repository.get_by_id::<BankAccount>(bob_id).await?;
    repository.delete(&mut bob).await?;
    wait_for(|| {
        totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open_accounts
            == 1
    })
    .await?;
    projector.stop("ledger-totals").await?;

    // A closed account no longer loads, but its history stays readable.
    let closed = repository
        .get_by_id::<BankAccount>(bob_id)
        .await
        .expect_err("closed accounts do not load");
    assert!(matches!(closed, RepositoryError::Deleted(_)));
    let historical = repository.get_by_id_as_of::<BankAccount>(bob_id, 1).await?;
    println!(
        "{} before closing = {}",
        historical.state().owner,
        historical.state().balance
    );
    assert_eq!(historical.state().balance, 50);

    let totals = totals.lock().unwrap_or_else(PoisonError::into_inner);
    println!(
        "ledger: open={}, deposited={}, withdrawn={}",
        totals.open_accounts, totals.deposited, totals.withdrawn
    );
    assert_eq!(totals.open_accounts, 1);
    assert_eq!(totals.deposited, 150);
    assert_eq!(totals.withdrawn, 30);

    println!("all assertions passed");

    Ok(())
}
