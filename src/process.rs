//! Process managers: cross-aggregate workflows as persisted state machines.
//!
//! A process manager reacts to events from other aggregates and answers
//! with follow-up commands, but unlike a projection it has decisions to
//! remember: which steps already ran, what it is still waiting for. Here
//! that memory is not a checkpoint file bolted on the side -- a process
//! manager *is* an aggregate. Its state is folded from its own event
//! stream, one instance per correlation chain, and its reactions are pure
//! functions of that state. Crash recovery then needs no special machinery:
//! redelivered input events meet a state that already recorded the step and
//! react to nothing.

use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::command::{Command, CommandDispatcher};
use crate::entity::{AggregateState, EventSourcedEntity};
use crate::error::BoxedError;
use crate::event::{DomainEvent, stream_uuid};
use crate::projector::{EventContext, EventProjector};
use crate::repository::Repository;
use crate::store::EventStore;

/// A workflow coordinator whose state is an event-sourced aggregate.
///
/// The [`AggregateState`] supertrait carries the durable side: the manager's
/// own events ([`AggregateState::Event`]) and the fold that rebuilds its
/// memory. This trait adds the reactive side: which foreign events it
/// consumes and what it does about them.
///
/// # Contract
///
/// * [`react`](Self::react) must be pure: same state, same event, same
///   reaction. All memory lives in the folded state; recording a decision
///   means returning it as one of the manager's own events.
/// * Delivery is at-least-once, so `react` must answer an already-handled
///   event with [`Reaction::none`]. The usual shape is a stage field that
///   advances with each recorded event and gates each reaction.
/// * One instance exists per correlation chain: the stream id is derived
///   from [`NAME`](Self::NAME) and the chain's correlation id. Workflows
///   spanning several aggregates work because every message in the chain
///   shares that id.
pub trait ProcessManager: AggregateState {
    /// Consumer name, and the namespace kind for instance stream ids.
    const NAME: &'static str;

    /// The foreign event type this manager reacts to.
    type Input: DomainEvent;

    /// The command payload this manager issues.
    type Command: Send + 'static;

    /// Decide what `event` means for this instance.
    fn react(
        &self,
        event: &Self::Input,
        context: &EventContext,
    ) -> Reaction<Self::Event, Self::Command>;
}

/// A command drafted by a process manager, not yet tied to a context.
///
/// The runner stamps the final [`Command`] so its causation points at the
/// event that provoked it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDraft<C> {
    /// The aggregate instance the command targets.
    pub target: Uuid,
    /// The command payload.
    pub payload: C,
}

/// Everything a process manager wants done about one event.
#[derive(Debug)]
pub struct Reaction<E, C> {
    events: Vec<E>,
    commands: Vec<CommandDraft<C>>,
}

impl<E, C> Default for Reaction<E, C> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            commands: Vec::new(),
        }
    }
}

impl<E, C> Reaction<E, C> {
    /// React to nothing; for events this instance has already handled or
    /// never cared about.
    pub fn none() -> Self {
        Self::default()
    }

    /// Record one of the manager's own events, persisting the decision.
    pub fn record(mut self, event: E) -> Self {
        self.events.push(event);
        self
    }

    /// Draft a command for another aggregate.
    pub fn dispatch(mut self, target: Uuid, payload: C) -> Self {
        self.commands.push(CommandDraft { target, payload });
        self
    }

    /// Whether this reaction records or dispatches anything at all.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.commands.is_empty()
    }

    /// The manager's own events to be recorded.
    pub fn events(&self) -> &[E] {
        &self.events
    }

    /// The drafted commands, in dispatch order.
    pub fn commands(&self) -> &[CommandDraft<C>] {
        &self.commands
    }
}

/// Wire a process manager into `projector` under its own consumer name.
///
/// Each delivered input event loads (or creates) the instance owning the
/// event's correlation chain, asks it to react, dispatches the drafted
/// commands, and finally records the reaction's events on the instance's
/// own stream. Commands are dispatched *before* the save: if the process
/// crashes in between, the unadvanced checkpoint replays the input event,
/// and the not-yet-recorded state reacts again. Redelivery with a recorded
/// state is the reverse case and reacts to nothing. Either way the workflow
/// converges, which is why dispatched commands must themselves be
/// idempotent or guarded by their target.
///
/// A dispatch or save failure fails the handler and falls to the
/// projector's [`FailurePolicy`](crate::FailurePolicy).
pub fn register_process_manager<P, S, C, D>(
    projector: &mut EventProjector<S, C>,
    repository: Repository<S>,
    dispatcher: D,
) where
    P: ProcessManager,
    S: EventStore + Clone + 'static,
    C: CheckpointStore + Clone + 'static,
    D: CommandDispatcher<P::Command> + Clone + 'static,
{
    projector.subscribe(P::NAME, move |event: P::Input, context: EventContext| {
        let repository = repository.clone();
        let dispatcher = dispatcher.clone();
        async move { run_reaction::<P, _, _>(&repository, &dispatcher, event, context).await }
    });
}

async fn run_reaction<P, S, D>(
    repository: &Repository<S>,
    dispatcher: &D,
    event: P::Input,
    context: EventContext,
) -> Result<(), BoxedError>
where
    P: ProcessManager,
    S: EventStore,
    D: CommandDispatcher<P::Command>,
{
    let chain = context.correlation.correlation_id();
    let instance_id = stream_uuid(P::NAME, &chain.to_string());
    let mut instance = match repository.try_get_by_id::<P>(instance_id).await? {
        Some(instance) => instance,
        None => EventSourcedEntity::fresh(instance_id),
    };

    let Reaction { events, commands } = instance.state().react(&event, &context);
    if events.is_empty() && commands.is_empty() {
        return Ok(());
    }
    tracing::debug!(
        process_manager = P::NAME,
        instance_id = %instance_id,
        input_position = context.position,
        events = events.len(),
        commands = commands.len(),
        "process manager reacting"
    );

    for draft in commands {
        let command = Command::caused_by(draft.target, draft.payload, &context.correlation);
        dispatcher.dispatch(command).await?;
    }

    instance.set_source(context.correlation);
    for produced in events {
        instance.raise(produced);
    }
    repository.save(&mut instance).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::correlation::CorrelationContext;
    use crate::entity::test_fixtures::{Account, AccountEvent};
    use crate::error::ProjectorError;
    use crate::store::InMemoryEventStore;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum BonusEvent {
        BonusGranted { amount: i64 },
    }

    impl DomainEvent for BonusEvent {
        const TYPES: &'static [&'static str] = &["BonusGranted"];
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    enum Stage {
        #[default]
        Waiting,
        Granted,
    }

    /// Grants a one-time welcome bonus to every newly created account.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct WelcomeBonus {
        stage: Stage,
    }

    impl AggregateState for WelcomeBonus {
        const AGGREGATE_TYPE: &'static str = "welcome-bonus";
        type Event = BonusEvent;

        fn apply(&mut self, event: &BonusEvent) {
            match event {
                BonusEvent::BonusGranted { .. } => self.stage = Stage::Granted,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum AccountCommand {
        Deposit { amount: i64 },
    }

    impl ProcessManager for WelcomeBonus {
        const NAME: &'static str = "welcome-bonus";
        type Input = AccountEvent;
        type Command = AccountCommand;

        fn react(
            &self,
            event: &AccountEvent,
            context: &EventContext,
        ) -> Reaction<BonusEvent, AccountCommand> {
            match (self.stage, event) {
                (Stage::Waiting, AccountEvent::AccountCreated { .. }) => Reaction::none()
                    .record(BonusEvent::BonusGranted { amount: 25 })
                    .dispatch(context.stream_id, AccountCommand::Deposit { amount: 25 }),
                _ => Reaction::none(),
            }
        }
    }

    /// Executes account commands straight against the repository.
    #[derive(Clone)]
    struct AccountDispatcher {
        repository: Repository<InMemoryEventStore>,
    }

    impl CommandDispatcher<AccountCommand> for AccountDispatcher {
        async fn dispatch(&self, command: Command<AccountCommand>) -> Result<(), BoxedError> {
            let AccountCommand::Deposit { amount } = command.payload;
            let mut account = self
                .repository
                .get_by_id::<Account>(command.aggregate_id)
                .await?;
            account.set_source(command.context);
            account.raise(AccountEvent::FundsDeposited { amount });
            self.repository.save(&mut account).await?;
            Ok(())
        }
    }

    fn event_context(stream_id: Uuid, correlation: CorrelationContext) -> EventContext {
        EventContext {
            stream_id,
            version: 0,
            position: 0,
            correlation,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition should hold within the timeout");
    }

    #[test]
    fn reaction_builders_accumulate() {
        let target = Uuid::new_v4();
        let reaction: Reaction<BonusEvent, AccountCommand> = Reaction::none()
            .record(BonusEvent::BonusGranted { amount: 10 })
            .record(BonusEvent::BonusGranted { amount: 20 })
            .dispatch(target, AccountCommand::Deposit { amount: 10 });

        assert!(!reaction.is_empty());
        assert_eq!(reaction.events().len(), 2);
        assert_eq!(
            reaction.commands(),
            &[CommandDraft {
                target,
                payload: AccountCommand::Deposit { amount: 10 },
            }]
        );
        assert!(Reaction::<BonusEvent, AccountCommand>::none().is_empty());
    }

    #[test]
    fn reactions_are_gated_by_the_folded_stage() {
        let account_id = Uuid::new_v4();
        let context = event_context(account_id, CorrelationContext::origin());

        let waiting = WelcomeBonus::default();
        let reaction = waiting.react(&AccountEvent::AccountCreated { balance: 0 }, &context);
        assert_eq!(reaction.events(), &[BonusEvent::BonusGranted { amount: 25 }]);
        assert_eq!(reaction.commands()[0].target, account_id);

        // Once the grant is folded in, the same event means nothing.
        let mut granted = WelcomeBonus::default();
        granted.apply(&BonusEvent::BonusGranted { amount: 25 });
        assert!(
            granted
                .react(&AccountEvent::AccountCreated { balance: 0 }, &context)
                .is_empty()
        );

        // Events the workflow never cared about mean nothing at any stage.
        assert!(
            waiting
                .react(&AccountEvent::FundsDeposited { amount: 5 }, &context)
                .is_empty()
        );
    }

    #[tokio::test]
    async fn grants_the_bonus_end_to_end() {
        let store = InMemoryEventStore::new();
        let repository = Repository::new(store.clone());
        let dispatcher = AccountDispatcher {
            repository: repository.clone(),
        };
        let mut projector = EventProjector::new(store.clone(), InMemoryCheckpointStore::new());
        register_process_manager::<WelcomeBonus, _, _, _>(
            &mut projector,
            repository.clone(),
            dispatcher,
        );
        projector
            .start(WelcomeBonus::NAME)
            .expect("start should succeed");

        let open_account = CorrelationContext::origin();
        let account_id = Uuid::new_v4();
        let mut account = EventSourcedEntity::<Account>::fresh(account_id);
        account.set_source(open_account);
        account.raise(AccountEvent::AccountCreated { balance: 0 });
        repository
            .save(&mut account)
            .await
            .expect("creating the account should succeed");

        // Creation, the dispatched deposit, and the grant record: 3 events.
        wait_until(|| store.head_position() >= 3).await;
        projector
            .stop(WelcomeBonus::NAME)
            .await
            .expect("stop should succeed");

        let account = repository
            .get_by_id::<Account>(account_id)
            .await
            .expect("account should load");
        assert_eq!(account.state().balance, 25);
        assert_eq!(account.version(), Some(1));

        let instance_id = stream_uuid(
            WelcomeBonus::NAME,
            &open_account.correlation_id().to_string(),
        );
        let bonus = repository
            .get_by_id::<WelcomeBonus>(instance_id)
            .await
            .expect("the workflow instance should be persisted");
        assert_eq!(bonus.state().stage, Stage::Granted);

        // The whole exchange shares one correlation chain, and each hop is
        // caused by the message before it.
        let account_events = store
            .read_stream(account_id, 0, u64::MAX)
            .await
            .expect("account stream should read");
        let created = &account_events[0];
        let deposited = &account_events[1];
        assert_eq!(
            created.context.correlation_id(),
            open_account.correlation_id()
        );
        assert_eq!(
            deposited.context.correlation_id(),
            open_account.correlation_id()
        );
        assert_ne!(
            deposited.context.causation_id(),
            created.context.message_id(),
            "the deposit is caused by the dispatched command, not the event itself"
        );

        let bonus_events = store
            .read_stream(instance_id, 0, u64::MAX)
            .await
            .expect("workflow stream should read");
        assert_eq!(
            bonus_events[0].context.causation_id(),
            created.context.message_id(),
            "the grant record is caused by the creation event"
        );
    }

    #[tokio::test]
    async fn redelivered_history_grants_nothing_twice() {
        let store = InMemoryEventStore::new();
        let repository = Repository::new(store.clone());
        let dispatcher = AccountDispatcher {
            repository: repository.clone(),
        };

        // First pass: the workflow runs to completion.
        let mut projector = EventProjector::new(store.clone(), InMemoryCheckpointStore::new());
        register_process_manager::<WelcomeBonus, _, _, _>(
            &mut projector,
            repository.clone(),
            dispatcher.clone(),
        );
        projector
            .start(WelcomeBonus::NAME)
            .expect("start should succeed");

        let account_id = Uuid::new_v4();
        let mut account = EventSourcedEntity::<Account>::fresh(account_id);
        account.set_source(CorrelationContext::origin());
        account.raise(AccountEvent::AccountCreated { balance: 0 });
        repository
            .save(&mut account)
            .await
            .expect("creating the account should succeed");
        wait_until(|| store.head_position() >= 3).await;
        projector
            .stop(WelcomeBonus::NAME)
            .await
            .expect("stop should succeed");

        // Second pass with a blank checkpoint store replays everything.
        // The persisted stage absorbs the replay: no new dispatch, no new
        // grant record.
        let mut replay = EventProjector::new(store.clone(), InMemoryCheckpointStore::new());
        register_process_manager::<WelcomeBonus, _, _, _>(
            &mut replay,
            repository.clone(),
            dispatcher,
        );
        replay
            .start(WelcomeBonus::NAME)
            .expect("replay start should succeed");
        wait_until(|| replay.is_caught_up(WelcomeBonus::NAME)).await;
        replay
            .stop(WelcomeBonus::NAME)
            .await
            .expect("replay stop should succeed");

        assert_eq!(store.head_position(), 3, "replay appended nothing");
        let account = repository
            .get_by_id::<Account>(account_id)
            .await
            .expect("account should load");
        assert_eq!(account.state().balance, 25);
    }

    /// A dispatcher whose target system is down.
    #[derive(Clone)]
    struct FailingDispatcher;

    impl CommandDispatcher<AccountCommand> for FailingDispatcher {
        async fn dispatch(&self, _command: Command<AccountCommand>) -> Result<(), BoxedError> {
            Err("target system unavailable".into())
        }
    }

    #[tokio::test]
    async fn dispatch_failure_leaves_no_partial_state() {
        let store = InMemoryEventStore::new();
        let checkpoints = InMemoryCheckpointStore::new();
        let repository = Repository::new(store.clone());

        let mut projector = EventProjector::new(store.clone(), checkpoints.clone());
        register_process_manager::<WelcomeBonus, _, _, _>(
            &mut projector,
            repository.clone(),
            FailingDispatcher,
        );
        projector
            .start(WelcomeBonus::NAME)
            .expect("start should succeed");

        let open_account = CorrelationContext::origin();
        let mut account = EventSourcedEntity::<Account>::fresh(Uuid::new_v4());
        account.set_source(open_account);
        account.raise(AccountEvent::AccountCreated { balance: 0 });
        repository
            .save(&mut account)
            .await
            .expect("creating the account should succeed");

        // Under the default Block policy the consumer stops at the event.
        wait_until(|| !projector.is_running(WelcomeBonus::NAME)).await;
        assert!(matches!(
            projector.stop(WelcomeBonus::NAME).await,
            Err(ProjectorError::Handler { .. })
        ));

        // Commands go out before the instance is saved, so a failed
        // dispatch leaves neither a checkpoint nor a workflow stream; the
        // event is simply redelivered on the next start.
        assert_eq!(
            checkpoints
                .get_checkpoint(WelcomeBonus::NAME)
                .await
                .expect("checkpoint read should succeed"),
            None
        );
        let instance_id = stream_uuid(
            WelcomeBonus::NAME,
            &open_account.correlation_id().to_string(),
        );
        assert!(
            repository
                .try_get_by_id::<WelcomeBonus>(instance_id)
                .await
                .expect("lookup should succeed")
                .is_none()
        );
    }
}
