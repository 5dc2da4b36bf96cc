//! Task Manager Tests
//!
//! Covers the scheduling pipeline at two levels:
//!
//! - **End to end**: a `TaskManager` running on the in-process store, driven only through the
//!   cluster APIs and runtime registrations, observed by polling the task map.
//! - **Components**: listeners, actions, the scanner, selectors and the processor exercised one
//!   call at a time, with the resulting messages read straight off an `ActionQueue` receiver.

#[cfg(test)]
mod tests {
    use crate::cluster::ClusterContext;
    use crate::cluster::protocol::{
        CONTEXT_STATE_TOPIC, ClusterMessage, GLOBAL_TOPIC, lease_counter_name,
    };
    use crate::config::SchedulerConfig;
    use crate::error::{Result, SchedulerError};
    use crate::manager::action::{
        ChangeOwnerTaskAction, CheckSchedulabilityAction, RescheduleTaskAction, ScheduleTaskAction,
        TaskAction, TaskContextCheckerAction,
    };
    use crate::manager::listener::{
        ContextListener, ContextStateNotifier, RuntimeListener, TaskListener,
    };
    use crate::manager::selector::{
        QueryRuntimeSelection, RandomRuntimeSelection, RuntimeSelection,
    };
    use crate::manager::{ActionQueue, LocalKeyScanner, ScanReport, TaskManager, TaskMessage, processor};
    use crate::model::{
        ContextState, ContextTask, Exclusivity, RuntimeInfo, RuntimeQuery, TaskContextDescriptor,
        TaskContextEntry, TaskDescriptor, TaskEntry, TaskState,
    };
    use crate::store::memory::MemoryCluster;
    use crate::store::{EntryEvent, Expiry, NodeId, ObjectKind, Versioned};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            lock_timeout_secs: 1,
            // Scans are driven by hand.
            scanner_initial_delay_secs: 3600,
            scheduled_lease_passes: 2,
            ..SchedulerConfig::default()
        }
    }

    fn single_node() -> ClusterContext {
        let cluster = MemoryCluster::new();
        let node = cluster.join(NodeId("node-1".into()));
        ClusterContext::from_memory(&node, test_config()).unwrap()
    }

    /// Single node whose scheduled entries expire after one second. The store is returned so
    /// tests can sweep it by hand.
    fn short_ttl_node() -> (Arc<MemoryCluster>, ClusterContext) {
        let memory = MemoryCluster::new();
        let node = memory.join(NodeId("node-1".into()));
        let config = SchedulerConfig {
            scheduled_ttl_secs: 1,
            ..test_config()
        };
        let cluster = ClusterContext::from_memory(&node, config).unwrap();
        (memory, cluster)
    }

    async fn register_runtime(cluster: &ClusterContext, runtime: RuntimeInfo) {
        let id = runtime.id.clone();
        cluster.runtime_map().put(&id, runtime, Expiry::Never).await.unwrap();
    }

    async fn put_task(cluster: &ClusterContext, entry: TaskEntry) -> Versioned<TaskEntry> {
        let id = entry.id.clone();
        let version = cluster.task_map().put(&id, entry.clone(), Expiry::Never).await.unwrap();
        Versioned::new(version, entry)
    }

    fn scheduled_on(runtime_id: &str, owner: Option<&str>) -> TaskEntry {
        let mut entry = TaskEntry::new(TaskDescriptor::new("t"), "ctx");
        entry.set_state(TaskState::Scheduled, "test setup");
        entry.runtime_id = Some(runtime_id.to_string());
        entry.owner_id = owner.map(|owner| NodeId(owner.to_string()));
        entry
    }

    async fn wait_for_task(
        cluster: &ClusterContext,
        task_id: &str,
        check: impl Fn(&TaskEntry) -> bool,
    ) -> TaskEntry {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(entry) = cluster.tasks().get(task_id).await.unwrap()
                && check(&entry.value)
            {
                return entry.value;
            }
            assert!(Instant::now() < deadline, "task '{task_id}' never reached the expected state");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_state(cluster: &ClusterContext, task_id: &str, state: TaskState) -> TaskEntry {
        wait_for_task(cluster, task_id, |entry| entry.state == state).await
    }

    async fn wait_for_context(cluster: &ClusterContext, context_id: &str, state: ContextState) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(entry) = cluster.contexts().get(context_id).await.unwrap()
                && entry.value.state == state
            {
                return;
            }
            assert!(Instant::now() < deadline, "context '{context_id}' never reached {state}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<TaskMessage>) -> Vec<TaskMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    // ============================================================
    // END TO END
    // ============================================================

    #[tokio::test]
    async fn test_free_task_is_scheduled_on_idle_runtime() {
        // ARRANGE
        let cluster = single_node();
        let manager = TaskManager::start(cluster.clone());
        let mut global = cluster.topics().subscribe(GLOBAL_TOPIC);
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;

        // ACT
        let task_id = cluster
            .tasks()
            .submit(TaskEntry::new(TaskDescriptor::new("compile"), "ctx"))
            .await
            .unwrap();

        // ASSERT
        let entry = wait_for_state(&cluster, &task_id, TaskState::Scheduled).await;
        assert_eq!(entry.owner_id, Some(NodeId("node-1".into())));
        assert_eq!(entry.runtime_id.as_deref(), Some("worker-1"));
        assert_eq!(
            global.recv().await.unwrap(),
            ClusterMessage::RunTask {
                sender_id: NodeId("node-1".into()),
                receiver_id: "worker-1".into(),
                task_id: task_id.clone(),
            }
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_dependent_task_runs_after_its_dependency() {
        let cluster = single_node();
        let manager = TaskManager::start(cluster.clone());
        let mut states = cluster.topics().subscribe(CONTEXT_STATE_TOPIC);
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;

        let descriptor = TaskContextDescriptor::new("pipeline")
            .with_task(ContextTask::inline("a", TaskDescriptor::new("a")))
            .with_task(ContextTask::inline("b", TaskDescriptor::new("b")).run_after("a"));
        let context_id = cluster.contexts().submit(descriptor, None).await.unwrap();
        wait_for_context(&cluster, &context_id, ContextState::Running).await;

        let context = cluster.contexts().get(&context_id).await.unwrap().unwrap().value;
        let mut ids = Vec::new();
        for task_id in &context.contained_task {
            // Tasks are submitted right after the context turns RUNNING.
            let task = wait_for_task(&cluster, task_id, |_| true).await;
            ids.push((task.descriptor.name.clone(), task.id));
        }
        ids.sort();
        let (a, b) = (ids[0].1.clone(), ids[1].1.clone());

        wait_for_state(&cluster, &a, TaskState::Scheduled).await;
        wait_for_state(&cluster, &b, TaskState::Waiting).await;

        // ACT: the runtime reports A done
        cluster.tasks().report_state(&a, TaskState::Finished, "exit 0").await.unwrap();

        let b_entry = wait_for_state(&cluster, &b, TaskState::Scheduled).await;
        let b_states: Vec<TaskState> = b_entry.state_log.iter().map(|change| change.state).collect();
        assert_eq!(
            b_states,
            vec![TaskState::Submitted, TaskState::Waiting, TaskState::Scheduled]
        );

        // ACT: and then B
        cluster.tasks().report_state(&b, TaskState::Finished, "exit 0").await.unwrap();
        wait_for_context(&cluster, &context_id, ContextState::Finished).await;

        let finished = ClusterMessage::ContextStateChanged {
            context_id: context_id.clone(),
            state: ContextState::Finished,
        };
        let announced = tokio::time::timeout(Duration::from_secs(2), async {
            while let Ok(message) = states.recv().await {
                if message == finished {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(announced, Ok(true)));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_aborted_dependency_aborts_dependent() {
        let cluster = single_node();
        let manager = TaskManager::start(cluster.clone());
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;

        let first = cluster
            .tasks()
            .submit(TaskEntry::new(TaskDescriptor::new("first"), "ctx"))
            .await
            .unwrap();
        wait_for_state(&cluster, &first, TaskState::Scheduled).await;
        let second = cluster
            .tasks()
            .submit(TaskEntry::new(TaskDescriptor::new("second"), "ctx").with_dependency(&first))
            .await
            .unwrap();
        wait_for_state(&cluster, &second, TaskState::Waiting).await;

        cluster.tasks().report_state(&first, TaskState::Aborted, "crashed").await.unwrap();

        let entry = wait_for_state(&cluster, &second, TaskState::Aborted).await;
        assert!(entry.last_reason().unwrap().contains("was aborted"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_evicted_runtime_aborts_only_its_tasks() {
        // ARRANGE
        let memory = MemoryCluster::new();
        let node = memory.join(NodeId("node-1".into()));
        let cluster = ClusterContext::from_memory(&node, test_config()).unwrap();
        let manager = TaskManager::start(cluster.clone());
        let mut global = cluster.topics().subscribe(GLOBAL_TOPIC);

        cluster
            .runtime_map()
            .put(
                "worker-1",
                RuntimeInfo::new("worker-1"),
                Expiry::After(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        register_runtime(&cluster, RuntimeInfo::new("worker-2")).await;

        let doomed_a = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await.value.id;
        let doomed_b = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await.value.id;
        let survivor = put_task(&cluster, scheduled_on("worker-2", Some("node-1"))).await.value.id;

        // ACT
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(memory.sweep_expired() >= 1);

        // ASSERT
        wait_for_state(&cluster, &doomed_a, TaskState::Aborted).await;
        wait_for_state(&cluster, &doomed_b, TaskState::Aborted).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut aborted = Vec::new();
        while let Ok(message) = global.try_recv() {
            if let ClusterMessage::AbortTask { receiver_id, task_id, .. } = message {
                assert_eq!(receiver_id.as_deref(), Some("worker-1"));
                aborted.push(task_id);
            }
        }
        aborted.sort();
        let mut expected = vec![doomed_a, doomed_b];
        expected.sort();
        assert_eq!(aborted, expected);

        let survivor = cluster.tasks().get(&survivor).await.unwrap().unwrap().value;
        assert_eq!(survivor.state, TaskState::Scheduled);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_exclusive_task_without_runtime_is_aborted() {
        let cluster = single_node();
        let manager = TaskManager::start(cluster.clone());

        let task_id = cluster
            .tasks()
            .submit(TaskEntry::new(
                TaskDescriptor::new("isolated").with_exclusivity(Exclusivity::Exclusive),
                "ctx",
            ))
            .await
            .unwrap();

        let entry = wait_for_state(&cluster, &task_id, TaskState::Aborted).await;
        assert_eq!(entry.last_reason(), Some("no runtime found"));
        assert!(entry.owner_id.is_none());

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_and_returns() {
        let cluster = single_node();
        let manager = TaskManager::start(cluster);

        let stopped = tokio::time::timeout(Duration::from_secs(2), manager.stop()).await;

        assert!(stopped.is_ok());
    }

    // ============================================================
    // SCHEDULE ACTION
    // ============================================================

    #[tokio::test]
    async fn test_no_runtime_aborts_without_taking_the_lock() {
        let cluster = single_node();
        register_runtime(&cluster, RuntimeInfo::new("busy").with_task_count(3)).await;
        let entry = put_task(
            &cluster,
            TaskEntry::new(
                TaskDescriptor::new("isolated").with_exclusivity(Exclusivity::Exclusive),
                "ctx",
            ),
        )
        .await;

        // Held for the whole attempt: any lock wait would time out and leave the task alone.
        let token = cluster
            .task_map()
            .try_lock(&entry.value.id, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        ScheduleTaskAction::new(entry.clone()).execute(&cluster).await.unwrap();

        let stored = cluster.tasks().get(&entry.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Aborted);
        assert_eq!(stored.last_reason(), Some("no runtime found"));
        cluster.task_map().unlock(&entry.value.id, &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_schedule_has_one_winner() {
        // ARRANGE: two nodes act on the same snapshot
        let memory = MemoryCluster::new();
        let first = ClusterContext::from_memory(&memory.join(NodeId("node-1".into())), test_config())
            .unwrap();
        let second = ClusterContext::from_memory(&memory.join(NodeId("node-2".into())), test_config())
            .unwrap();
        let mut global = first.topics().subscribe(GLOBAL_TOPIC);
        register_runtime(&first, RuntimeInfo::new("worker-1")).await;
        let snapshot = put_task(&first, TaskEntry::new(TaskDescriptor::new("t"), "ctx")).await;

        // ACT
        let on_first = ScheduleTaskAction::new(snapshot.clone());
        let on_second = ScheduleTaskAction::new(snapshot.clone());
        let (a, b) = tokio::join!(on_first.execute(&first), on_second.execute(&second));
        a.unwrap();
        b.unwrap();

        // ASSERT
        let stored = first.tasks().get(&snapshot.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Scheduled);
        assert!(stored.owner_id.is_some());
        let scheduled_writes = stored
            .state_log
            .iter()
            .filter(|change| change.state == TaskState::Scheduled)
            .count();
        assert_eq!(scheduled_writes, 1);

        let mut run_messages = 0;
        while let Ok(message) = global.try_recv() {
            if matches!(message, ClusterMessage::RunTask { .. }) {
                run_messages += 1;
            }
        }
        assert_eq!(run_messages, 1);
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_mutate() {
        let memory = MemoryCluster::new();
        let first = ClusterContext::from_memory(&memory.join(NodeId("node-1".into())), test_config())
            .unwrap();
        let second = ClusterContext::from_memory(&memory.join(NodeId("node-2".into())), test_config())
            .unwrap();
        register_runtime(&first, RuntimeInfo::new("worker-1")).await;
        let snapshot = put_task(&first, TaskEntry::new(TaskDescriptor::new("t"), "ctx")).await;

        ScheduleTaskAction::new(snapshot.clone()).execute(&first).await.unwrap();
        let after_first = first.tasks().get(&snapshot.value.id).await.unwrap().unwrap();

        ScheduleTaskAction::new(snapshot.clone()).execute(&second).await.unwrap();
        let after_second = first.tasks().get(&snapshot.value.id).await.unwrap().unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.value.owner_id, Some(NodeId("node-1".into())));
    }

    #[tokio::test]
    async fn test_schedule_sets_lease_and_safety_ttl() {
        let (memory, cluster) = short_ttl_node();
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;
        let snapshot = put_task(&cluster, TaskEntry::new(TaskDescriptor::new("t"), "ctx")).await;

        ScheduleTaskAction::new(snapshot.clone()).execute(&cluster).await.unwrap();

        let counters = cluster.objects().object_names(ObjectKind::Counter).await.unwrap();
        assert_eq!(counters, vec![lease_counter_name(&snapshot.value.id)]);
        assert!(cluster.tasks().get(&snapshot.value.id).await.unwrap().is_some());

        // Nobody acknowledged or demoted the task: the safety TTL removes it.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(memory.sweep_expired(), 1);
        assert!(cluster.tasks().get(&snapshot.value.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_expiry_demotes_before_safety_ttl_evicts() {
        // ARRANGE: a task scheduled on a runtime that never acknowledges it
        let (memory, cluster) = short_ttl_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let scanner = LocalKeyScanner::new(cluster.clone(), queue);
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;
        let snapshot = put_task(&cluster, TaskEntry::new(TaskDescriptor::new("t"), "ctx")).await;
        ScheduleTaskAction::new(snapshot.clone()).execute(&cluster).await.unwrap();

        // ACT: the lease runs out while the safety TTL is still pending
        scanner.scan().await.unwrap();
        let report = scanner.scan().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        for message in drain(&mut receiver) {
            message.into_action().unwrap().execute(&cluster).await.unwrap();
        }
        let demoted = cluster.tasks().get(&snapshot.value.id).await.unwrap().unwrap().value;
        assert_eq!(demoted.state, TaskState::Submitted);

        // ASSERT: the demoted entry no longer carries the TTL
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(memory.sweep_expired(), 0);
        let stored = cluster.tasks().get(&snapshot.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Submitted);
    }

    #[tokio::test]
    async fn test_pending_dependency_parks_task() {
        let cluster = single_node();
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;
        let dependency = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await;
        let dependent = put_task(
            &cluster,
            TaskEntry::new(TaskDescriptor::new("next"), "ctx").with_dependency(&dependency.value.id),
        )
        .await;

        ScheduleTaskAction::new(dependent.clone()).execute(&cluster).await.unwrap();

        let stored = cluster.tasks().get(&dependent.value.id).await.unwrap().unwrap();
        assert_eq!(stored.value.state, TaskState::Waiting);

        // Still pending: the check leaves the entry untouched.
        CheckSchedulabilityAction::new(stored.clone()).execute(&cluster).await.unwrap();
        assert_eq!(cluster.tasks().get(&dependent.value.id).await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn test_missing_dependency_aborts_task() {
        let cluster = single_node();
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;
        let mut waiting = TaskEntry::new(TaskDescriptor::new("next"), "ctx").with_dependency("gone");
        waiting.set_state(TaskState::Waiting, "test setup");
        let entry = put_task(&cluster, waiting).await;

        CheckSchedulabilityAction::new(entry.clone()).execute(&cluster).await.unwrap();

        let stored = cluster.tasks().get(&entry.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Aborted);
    }

    #[tokio::test]
    async fn test_context_checker_waits_for_all_tasks() {
        let cluster = single_node();
        let descriptor = TaskContextDescriptor::new("pair")
            .with_task(ContextTask::inline("a", TaskDescriptor::new("a")))
            .with_task(ContextTask::inline("b", TaskDescriptor::new("b")));
        let context_id = cluster.contexts().submit(descriptor, None).await.unwrap();
        cluster.contexts().run_context(&context_id).await.unwrap();
        let context = cluster.contexts().get(&context_id).await.unwrap().unwrap().value;
        let ids: Vec<String> = context.contained_task.into_iter().collect();

        cluster.tasks().report_state(&ids[0], TaskState::Finished, "ok").await.unwrap();
        let done = cluster.tasks().get(&ids[0]).await.unwrap().unwrap();
        TaskContextCheckerAction::new(done).execute(&cluster).await.unwrap();
        let state = cluster.contexts().get(&context_id).await.unwrap().unwrap().value.state;
        assert_eq!(state, ContextState::Running);

        cluster.tasks().report_state(&ids[1], TaskState::Aborted, "failed").await.unwrap();
        let done = cluster.tasks().get(&ids[1]).await.unwrap().unwrap();
        TaskContextCheckerAction::new(done).execute(&cluster).await.unwrap();
        let state = cluster.contexts().get(&context_id).await.unwrap().unwrap().value.state;
        assert_eq!(state, ContextState::Finished);
    }

    // ============================================================
    // SCANNER
    // ============================================================

    #[tokio::test]
    async fn test_scan_reclaims_unowned_task() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let scanner = LocalKeyScanner::new(cluster.clone(), queue);
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;
        let orphan = put_task(&cluster, scheduled_on("worker-1", Some("node-9"))).await;

        let report = scanner.scan().await.unwrap();

        assert_eq!(report.reclaimed, 1);
        let messages = drain(&mut receiver);
        assert_eq!(messages.len(), 1);
        let TaskMessage::ChangeOwner(entry) = messages[0].clone() else {
            panic!("expected ChangeOwner, got {}", messages[0].kind());
        };

        ChangeOwnerTaskAction::new(entry).execute(&cluster).await.unwrap();
        let stored = cluster.tasks().get(&orphan.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.owner_id, Some(NodeId("node-1".into())));
        assert_eq!(stored.state, TaskState::Scheduled);

        // Owned now: a second pass does not reclaim again.
        let report = scanner.scan().await.unwrap();
        assert_eq!(report.reclaimed, 0);
    }

    #[tokio::test]
    async fn test_reclaim_with_stale_snapshot_is_skipped() {
        let cluster = single_node();
        let stale = put_task(&cluster, scheduled_on("worker-1", None)).await;
        let mut moved = stale.value.clone();
        moved.owner_id = Some(NodeId("node-7".into()));
        cluster.task_map().put(&stale.value.id, moved.clone(), Expiry::Keep).await.unwrap();

        ChangeOwnerTaskAction::new(stale.clone()).execute(&cluster).await.unwrap();

        let stored = cluster.tasks().get(&stale.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored, moved);
    }

    #[tokio::test]
    async fn test_unacknowledged_task_is_rescheduled_after_lease() {
        // ARRANGE
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let scanner = LocalKeyScanner::new(cluster.clone(), queue);
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;
        let entry = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await;
        cluster
            .objects()
            .set_counter(&lease_counter_name(&entry.value.id), 2)
            .await
            .unwrap();

        // ACT / ASSERT: first pass burns one lease pass
        let report = scanner.scan().await.unwrap();
        assert_eq!(report.rescheduled, 0);
        assert!(drain(&mut receiver).is_empty());

        // ACT / ASSERT: second pass runs out
        let report = scanner.scan().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        let messages = drain(&mut receiver);
        let TaskMessage::RescheduleTask(stale) = messages[0].clone() else {
            panic!("expected RescheduleTask, got {}", messages[0].kind());
        };

        RescheduleTaskAction::new(stale).execute(&cluster).await.unwrap();
        let stored = cluster.tasks().get(&entry.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Submitted);
        assert!(stored.runtime_id.is_none());
        assert!(cluster.objects().object_names(ObjectKind::Counter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledged_and_final_tasks_are_left_alone() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let scanner = LocalKeyScanner::new(cluster.clone(), queue);
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;

        // Acknowledged: scheduled without a lease counter.
        put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await;
        let mut finished = scheduled_on("worker-1", Some("node-9"));
        finished.set_state(TaskState::Finished, "ok");
        put_task(&cluster, finished).await;

        let report = scanner.scan().await.unwrap();

        assert_eq!(
            report,
            ScanReport {
                scanned: 2,
                ..ScanReport::default()
            }
        );
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn test_scan_aborts_tasks_of_unregistered_runtime() {
        // ARRANGE: the runtime left without a removal event reaching this node
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let scanner = LocalKeyScanner::new(cluster.clone(), queue);
        let mut global = cluster.topics().subscribe(GLOBAL_TOPIC);
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;
        let orphaned = put_task(&cluster, scheduled_on("ghost", Some("node-1"))).await;
        let healthy = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await;

        // ACT
        let report = scanner.scan().await.unwrap();

        // ASSERT
        assert_eq!(
            report,
            ScanReport {
                scanned: 2,
                aborted: 1,
                ..ScanReport::default()
            }
        );
        let messages = drain(&mut receiver);
        assert_eq!(messages.len(), 1);
        let TaskMessage::AbortTask { task_id, .. } = &messages[0] else {
            panic!("expected AbortTask, got {}", messages[0].kind());
        };
        assert_eq!(task_id, &orphaned.value.id);

        for message in messages {
            message.into_action().unwrap().execute(&cluster).await.unwrap();
        }
        let stored = cluster.tasks().get(&orphaned.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Aborted);
        let untouched = cluster.tasks().get(&healthy.value.id).await.unwrap().unwrap();
        assert_eq!(untouched, healthy);
        assert!(matches!(
            global.try_recv(),
            Ok(ClusterMessage::AbortTask { receiver_id: Some(runtime), .. }) if runtime == "ghost"
        ));

        // Final now: the next pass leaves it to TTL eviction.
        let report = scanner.scan().await.unwrap();
        assert_eq!(report.aborted, 0);
    }

    #[tokio::test]
    async fn test_scan_rechecks_waiting_tasks() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let scanner = LocalKeyScanner::new(cluster.clone(), queue);
        let mut waiting = TaskEntry::new(TaskDescriptor::new("t"), "ctx").with_dependency("x");
        waiting.set_state(TaskState::Waiting, "test setup");
        waiting.owner_id = Some(NodeId("node-1".into()));
        put_task(&cluster, waiting).await;

        let report = scanner.scan().await.unwrap();

        assert_eq!(report.rechecked, 1);
        assert!(matches!(
            drain(&mut receiver).as_slice(),
            [TaskMessage::CheckSchedulability(_)]
        ));
    }

    // ============================================================
    // LISTENERS
    // ============================================================

    #[tokio::test]
    async fn test_task_listener_parks_task_behind_running_dependency() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let listener = TaskListener::new(cluster.clone(), queue);
        let dependency = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await;
        let added = put_task(
            &cluster,
            TaskEntry::new(TaskDescriptor::new("next"), "ctx").with_dependency(&dependency.value.id),
        )
        .await;

        listener
            .handle(EntryEvent::Added {
                key: added.value.id.clone(),
                value: added.clone(),
            })
            .await
            .unwrap();

        assert!(drain(&mut receiver).is_empty());
        let stored = cluster.tasks().get(&added.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Waiting);
    }

    #[tokio::test]
    async fn test_task_listener_dispatch() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let listener = TaskListener::new(cluster.clone(), queue);

        let submitted = Versioned::new(1, TaskEntry::new(TaskDescriptor::new("t"), "ctx"));
        listener
            .handle(EntryEvent::Added {
                key: submitted.value.id.clone(),
                value: submitted.clone(),
            })
            .await
            .unwrap();

        let mut waiting = submitted.clone();
        waiting.value.set_state(TaskState::Waiting, "dependency");
        listener
            .handle(EntryEvent::Updated {
                key: waiting.value.id.clone(),
                old: submitted.value.clone(),
                value: waiting.clone(),
            })
            .await
            .unwrap();

        let mut finished = waiting.clone();
        finished.value.set_state(TaskState::Finished, "ok");
        listener
            .handle(EntryEvent::Updated {
                key: finished.value.id.clone(),
                old: waiting.value.clone(),
                value: finished.clone(),
            })
            .await
            .unwrap();

        // Re-persisting a final task is not a new completion.
        listener
            .handle(EntryEvent::Updated {
                key: finished.value.id.clone(),
                old: finished.value.clone(),
                value: finished.clone(),
            })
            .await
            .unwrap();

        let kinds: Vec<&str> = drain(&mut receiver).iter().map(TaskMessage::kind).collect();
        assert_eq!(kinds, vec!["new_task", "check_schedulability", "task_changed"]);
    }

    #[tokio::test]
    async fn test_task_listener_aborts_evicted_unfinished_task() {
        // ARRANGE: a scheduled task outlives its safety TTL
        let (memory, cluster) = short_ttl_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let listener = TaskListener::new(cluster.clone(), queue);
        let mut global = cluster.topics().subscribe(GLOBAL_TOPIC);
        register_runtime(&cluster, RuntimeInfo::new("worker-1")).await;
        let snapshot = put_task(&cluster, TaskEntry::new(TaskDescriptor::new("t"), "ctx")).await;
        ScheduleTaskAction::new(snapshot.clone()).execute(&cluster).await.unwrap();
        let scheduled = cluster.tasks().get(&snapshot.value.id).await.unwrap().unwrap().value;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(memory.sweep_expired(), 1);

        // ACT
        listener
            .handle(EntryEvent::Evicted {
                key: scheduled.id.clone(),
                old: scheduled.clone(),
            })
            .await
            .unwrap();

        // ASSERT: written back as a final state and reported like any completion
        let stored = cluster.tasks().get(&scheduled.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Aborted);
        assert_eq!(stored.last_reason(), Some("evicted before reaching a final state"));
        assert!(cluster.objects().object_names(ObjectKind::Counter).await.unwrap().is_empty());
        let kinds: Vec<&str> = drain(&mut receiver).iter().map(TaskMessage::kind).collect();
        assert_eq!(kinds, vec!["task_changed"]);

        let mut abort_sent = false;
        while let Ok(message) = global.try_recv() {
            if let ClusterMessage::AbortTask { receiver_id, task_id, .. } = message {
                assert_eq!(receiver_id.as_deref(), Some("worker-1"));
                assert_eq!(task_id, scheduled.id);
                abort_sent = true;
            }
        }
        assert!(abort_sent);
    }

    #[tokio::test]
    async fn test_task_listener_lets_final_tasks_expire() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let listener = TaskListener::new(cluster.clone(), queue);
        let mut finished = scheduled_on("worker-1", Some("node-1"));
        finished.set_state(TaskState::Finished, "ok");

        listener
            .handle(EntryEvent::Evicted {
                key: finished.id.clone(),
                old: finished.clone(),
            })
            .await
            .unwrap();

        assert!(cluster.tasks().get(&finished.id).await.unwrap().is_none());
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn test_runtime_listener_aborts_tasks_of_removed_runtime() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let listener = RuntimeListener::new(cluster.clone(), queue);
        let gone = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await;
        put_task(&cluster, scheduled_on("worker-2", Some("node-1"))).await;
        let mut finished = scheduled_on("worker-1", Some("node-1"));
        finished.set_state(TaskState::Finished, "ok");
        put_task(&cluster, finished).await;

        listener
            .handle(EntryEvent::Removed {
                key: "worker-1".into(),
                old: RuntimeInfo::new("worker-1"),
            })
            .await
            .unwrap();

        let messages = drain(&mut receiver);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            TaskMessage::AbortTask { task_id, .. } if task_id == &gone.value.id
        ));
    }

    #[tokio::test]
    async fn test_runtime_listener_reevaluates_waiting_on_idle() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let listener = RuntimeListener::new(cluster.clone(), queue);
        let mut waiting = TaskEntry::new(TaskDescriptor::new("t"), "ctx");
        waiting.set_state(TaskState::Waiting, "test setup");
        put_task(&cluster, waiting).await;

        let busy = RuntimeInfo::new("worker-1").with_task_count(1);
        let idle = RuntimeInfo::new("worker-1");
        listener
            .handle(EntryEvent::Updated {
                key: "worker-1".into(),
                old: idle.clone(),
                value: Versioned::new(2, busy.clone()),
            })
            .await
            .unwrap();
        assert!(drain(&mut receiver).is_empty());

        listener
            .handle(EntryEvent::Updated {
                key: "worker-1".into(),
                old: busy,
                value: Versioned::new(3, idle),
            })
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut receiver).as_slice(),
            [TaskMessage::ScheduleTask(_)]
        ));
    }

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<(String, ContextState)>>,
    }

    #[async_trait]
    impl ContextStateNotifier for RecordingNotifier {
        async fn context_state_changed(&self, context_id: &str, state: ContextState) -> Result<()> {
            self.seen.lock().unwrap().push((context_id.to_string(), state));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_context_listener_runs_new_contexts_and_reports_changes() {
        let cluster = single_node();
        let (queue, mut receiver) = ActionQueue::channel();
        let notifier = Arc::new(RecordingNotifier::default());
        let listener = ContextListener::new(cluster.clone(), queue, notifier.clone());
        let descriptor = TaskContextDescriptor::new("c")
            .with_task(ContextTask::inline("a", TaskDescriptor::new("a")));
        let entry = TaskContextEntry::new(descriptor, None);
        let mut running = entry.clone();
        running.state = ContextState::Running;

        listener
            .handle(EntryEvent::Added {
                key: entry.id.clone(),
                value: Versioned::new(1, entry.clone()),
            })
            .await
            .unwrap();
        listener
            .handle(EntryEvent::Updated {
                key: entry.id.clone(),
                old: entry.clone(),
                value: Versioned::new(2, running),
            })
            .await
            .unwrap();

        assert!(matches!(
            drain(&mut receiver).as_slice(),
            [TaskMessage::RunContext { context_id }] if context_id == &entry.id
        ));
        assert_eq!(
            *notifier.seen.lock().unwrap(),
            vec![(entry.id.clone(), ContextState::Running)]
        );
    }

    // ============================================================
    // SELECTORS
    // ============================================================

    #[tokio::test]
    async fn test_random_selection_respects_exclusivity() {
        let cluster = single_node();
        register_runtime(&cluster, RuntimeInfo::new("busy").with_task_count(2)).await;
        register_runtime(
            &cluster,
            RuntimeInfo::new("reserved")
                .with_exclusivity(Exclusivity::ContextExclusive, Some("ctx-1".into()))
                .with_task_count(1),
        )
        .await;
        register_runtime(
            &cluster,
            RuntimeInfo::new("locked")
                .with_exclusivity(Exclusivity::Exclusive, Some("other".into()))
                .with_task_count(1),
        )
        .await;
        let selection = RandomRuntimeSelection;

        let plain = TaskEntry::new(TaskDescriptor::new("t"), "ctx-2");
        let contextual = TaskEntry::new(
            TaskDescriptor::new("t").with_exclusivity(Exclusivity::ContextExclusive),
            "ctx-1",
        );
        let exclusive = TaskEntry::new(
            TaskDescriptor::new("t").with_exclusivity(Exclusivity::Exclusive),
            "ctx-3",
        );

        assert_eq!(selection.select(cluster.runtime_map(), &plain).await.unwrap(), "busy");
        assert_eq!(
            selection.select(cluster.runtime_map(), &contextual).await.unwrap(),
            "reserved"
        );
        assert!(matches!(
            selection.select(cluster.runtime_map(), &exclusive).await,
            Err(SchedulerError::NoRuntimeFound(_))
        ));
    }

    #[tokio::test]
    async fn test_query_selection_filters_on_attributes() {
        let cluster = single_node();
        register_runtime(
            &cluster,
            RuntimeInfo::new("linux-big")
                .with_attribute("os", "Linux".into())
                .with_attribute("cores", 32.into()),
        )
        .await;
        register_runtime(
            &cluster,
            RuntimeInfo::new("linux-small")
                .with_attribute("os", "Linux".into())
                .with_attribute("cores", 2.into()),
        )
        .await;
        let task = TaskEntry::new(TaskDescriptor::new("t"), "ctx");

        let big = QueryRuntimeSelection::new(RuntimeQuery::and(vec![
            RuntimeQuery::eq("os", "linux"),
            RuntimeQuery::gt("cores", 8.0),
        ]));
        let windows = QueryRuntimeSelection::new(RuntimeQuery::eq("os", "windows"));

        assert_eq!(big.select(cluster.runtime_map(), &task).await.unwrap(), "linux-big");
        assert!(matches!(
            windows.select(cluster.runtime_map(), &task).await,
            Err(SchedulerError::NoRuntimeFound(_))
        ));
    }

    // ============================================================
    // PROCESSOR & MESSAGES
    // ============================================================

    #[tokio::test]
    async fn test_processor_stops_at_poison() {
        let cluster = single_node();
        let entry = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await;
        let (queue, receiver) = ActionQueue::channel();
        let handle = processor::spawn(cluster.clone(), receiver);

        queue.send(TaskMessage::Poison);
        queue.send(TaskMessage::AbortTask {
            task_id: entry.value.id.clone(),
            reason: "after poison".into(),
        });
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let stored = cluster.tasks().get(&entry.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Scheduled);
        assert!(!queue.send(TaskMessage::Poison));
    }

    #[tokio::test]
    async fn test_processor_survives_failing_action() {
        let cluster = single_node();
        let entry = put_task(&cluster, scheduled_on("worker-1", Some("node-1"))).await;
        let (queue, receiver) = ActionQueue::channel();
        let handle = processor::spawn(cluster.clone(), receiver);

        // Unknown context: the run fails and the loop carries on.
        queue.send(TaskMessage::RunContext {
            context_id: "missing".into(),
        });
        queue.send(TaskMessage::AbortTask {
            task_id: entry.value.id.clone(),
            reason: "operator".into(),
        });
        queue.send(TaskMessage::Poison);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let stored = cluster.tasks().get(&entry.value.id).await.unwrap().unwrap().value;
        assert_eq!(stored.state, TaskState::Aborted);
    }

    #[test]
    fn test_every_message_but_poison_has_an_action() {
        let entry = Versioned::new(1, TaskEntry::new(TaskDescriptor::new("t"), "ctx"));
        let messages = vec![
            TaskMessage::NewTask(entry.clone()),
            TaskMessage::ScheduleTask(entry.clone()),
            TaskMessage::CheckSchedulability(entry.clone()),
            TaskMessage::TaskChanged(entry.clone()),
            TaskMessage::AbortTask {
                task_id: "t".into(),
                reason: "r".into(),
            },
            TaskMessage::RunContext {
                context_id: "c".into(),
            },
            TaskMessage::ChangeOwner(entry.clone()),
            TaskMessage::RescheduleTask(entry),
        ];

        for message in messages {
            let kind = message.kind();
            assert!(message.into_action().is_some(), "{kind} has no action");
        }
        assert!(TaskMessage::Poison.into_action().is_none());
    }
}
