//! 回合控制器端到端场景

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    use reug::core::{
        DynamicToolRequest, ErrorKind, Event, GuardLimits, IntentPlanner, MailboxLimits, Plan, PlanError, Route,
        Strategy, TaskStatus, Trigger, TurnController, TurnResult, TurnState,
    };
    use reug::core::ParallelTaskSpec;
    use reug::observability::{ChannelTelemetry, TelemetryEvent, TransitionRecord};
    use reug::script::chain;
    use reug::tools::{EchoTool, Tool, ToolCall, ToolDescriptor, ToolRegistry};
    use reug::ReugError;

    /// 每次识别都返回同一份计划
    struct Scripted {
        plan: Plan,
    }

    #[async_trait]
    impl IntentPlanner for Scripted {
        async fn detect(&self, _input: &str, _tools: &[ToolDescriptor]) -> Result<Plan, PlanError> {
            Ok(self.plan.clone())
        }
    }

    /// 第一次合成缺少 description 的 Schema，之后合成合法的
    struct Synthesizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IntentPlanner for Synthesizer {
        async fn detect(&self, input: &str, _tools: &[ToolDescriptor]) -> Result<Plan, PlanError> {
            Ok(Plan::new(Route::DynamicTool(DynamicToolRequest {
                description: input.to_string(),
            })))
        }

        async fn synthesize_tool(&self, _request: &DynamicToolRequest) -> Result<Value, PlanError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Ok(json!({ "name": "fibonacci", "parameters": [] }));
            }
            Ok(json!({
                "name": "fibonacci",
                "description": "n-th fibonacci number",
                "parameters": [{ "name": "n", "type": "integer", "required": true }]
            }))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps for ten seconds"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("late".to_string())
        }
    }

    /// 开始执行时通知测试方，然后阻塞一段时间
    struct GatedTool {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Tool for GatedTool {
        fn name(&self) -> &str {
            "gated"
        }

        fn description(&self) -> &str {
            "signals start, then blocks for a while"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("gated done".to_string())
        }
    }

    struct BrokenTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("backend unavailable".to_string())
        }
    }

    fn echo_registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        Arc::new(registry)
    }

    fn echo(text: &str) -> ToolCall {
        ToolCall::new("echo", json!({ "text": text }))
    }

    fn controller(plan: Plan) -> TurnController {
        TurnController::builder(Arc::new(Scripted { plan }), echo_registry()).build()
    }

    #[tokio::test]
    async fn test_direct_answer_happy_path() {
        let mut ctl = controller(Plan::new(Route::Respond("4".into())));

        let report = ctl.submit(Event::UserInput("what is 2+2?".into())).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.state, TurnState::Complete);
        assert_eq!(
            ctl.turn().unwrap().result,
            Some(TurnResult::Success { response: "4".into() })
        );

        ctl.submit(Event::TurnComplete).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Ready);
        assert!(ctl.turn().is_none());

        let done = ctl.previous_turn().unwrap();
        assert_eq!(
            done.trigger_trail(),
            vec![
                Trigger::UserInput,
                Trigger::IntentDetected,
                Trigger::ToolsRouted,
                Trigger::ResponseReady,
                Trigger::TurnComplete,
            ]
        );
        assert_eq!(done.step_count, 0);
        assert_eq!(ctl.metrics().turns_finished, 1);
    }

    #[tokio::test]
    async fn test_direct_tool_call_returns_tool_output() {
        let mut ctl = controller(Plan::new(Route::Tools(vec![echo("ping")])));
        ctl.submit(Event::UserInput("echo ping".into())).await.unwrap();

        let turn = ctl.turn().unwrap();
        assert_eq!(turn.result, Some(TurnResult::Success { response: "ping".into() }));
        assert_eq!(turn.trigger_trail().last(), Some(&Trigger::ToolSuccess));
    }

    #[tokio::test]
    async fn test_three_step_script_runs_in_order() {
        let steps = chain(vec![echo("a"), echo("b"), echo("c")]);
        let mut ctl = controller(Plan::new(Route::Script(steps)));

        ctl.submit(Event::UserInput("run the script".into())).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Complete);

        let turn = ctl.turn().unwrap();
        assert_eq!(turn.step_count, 3);
        assert_eq!(
            turn.trigger_trail(),
            vec![
                Trigger::UserInput,
                Trigger::IntentDetected,
                Trigger::ScriptParsed,
                Trigger::ScriptStepComplete,
                Trigger::ScriptStepComplete,
                Trigger::ScriptExecutionComplete,
                Trigger::ResponseReady,
            ]
        );
        assert_eq!(turn.result, Some(TurnResult::Success { response: "a\nb\nc".into() }));
        assert_eq!(turn.recovery_attempts().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_schema_recovers_then_registers() {
        let registry = echo_registry();
        let planner = Arc::new(Synthesizer {
            calls: AtomicUsize::new(0),
        });
        let mut ctl = TurnController::builder(planner.clone(), registry.clone()).build();

        ctl.submit(Event::UserInput("I need a fibonacci tool".into())).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Complete);

        let turn = ctl.turn().unwrap();
        let trail = turn.trigger_trail();
        assert!(trail.contains(&Trigger::SchemaInvalid));
        assert!(trail.contains(&Trigger::RecoverySuccess));
        assert_eq!(trail.last(), Some(&Trigger::SchemaValidated));
        assert!(turn.result.as_ref().unwrap().is_success());

        let attempts: Vec<_> = turn.recovery_attempts().collect();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error_kind, ErrorKind::Validation);
        assert_eq!(attempts[0].strategy, Strategy::Retry);
        assert!(attempts[0].reasons.iter().any(|r| r.contains("description")));

        assert_eq!(planner.calls.load(Ordering::SeqCst), 2);
        assert!(registry.dynamic_schema("fibonacci").is_some());
        assert_eq!(ctl.dynamic_tools().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_timeout_degrades_and_discards_results() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let specs: Vec<_> = (0..4)
            .map(|i| ParallelTaskSpec::new(format!("t{i}"), ToolCall::new("slow", json!({}))))
            .collect();
        let (telemetry, mut events) = ChannelTelemetry::new();
        let mut ctl = TurnController::builder(
            Arc::new(Scripted {
                plan: Plan::new(Route::Parallel(specs)),
            }),
            Arc::new(registry),
        )
        .with_limits(GuardLimits {
            timeout: Duration::from_millis(100),
            ..GuardLimits::default()
        })
        .with_telemetry(Arc::new(telemetry))
        .build();

        ctl.submit(Event::UserInput("fan out".into())).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Complete);

        let turn = ctl.turn().unwrap();
        assert!(matches!(turn.result, Some(TurnResult::Degraded { .. })));
        assert!(turn.trigger_trail().contains(&Trigger::TimeoutDetected));
        assert_eq!(turn.parallel_tasks.len(), 4);
        assert!(turn
            .parallel_tasks
            .iter()
            .all(|t| t.status == TaskStatus::TimedOut && t.result.is_none()));

        // 超时不重试
        assert!(turn.recovery_attempts().all(|a| a.strategy != Strategy::Retry));
        assert_eq!(ctl.metrics().alerts, 1);

        let mut alerts = 0;
        while let Ok(event) = events.try_recv() {
            if let TelemetryEvent::Alert(alert) = event {
                assert_eq!(alert.error_kind, ErrorKind::Timeout);
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_step_budget_halts_long_script() {
        let calls: Vec<_> = (0..150).map(|i| echo(&format!("s{i}"))).collect();
        let mut ctl = controller(Plan::new(Route::Script(chain(calls))));

        ctl.submit(Event::UserInput("long job".into())).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Complete);

        let turn = ctl.turn().unwrap();
        assert_eq!(turn.step_count, 100);
        assert!(turn.trigger_trail().contains(&Trigger::StepBudgetExhausted));
        assert!(matches!(turn.result, Some(TurnResult::Degraded { .. })));

        let attempts: Vec<_> = turn.recovery_attempts().collect();
        assert!(attempts.iter().all(|a| a.strategy != Strategy::Retry));
        assert_eq!(attempts.last().unwrap().strategy, Strategy::OperatorAlert);
        assert_eq!(turn.retry_count, 0);
    }

    #[tokio::test]
    async fn test_next_input_after_complete_and_stale_callback() {
        let mut ctl = controller(Plan::new(Route::Respond("ok".into())));

        ctl.submit(Event::UserInput("first".into())).await.unwrap();
        let first = ctl.turn().unwrap();
        let (first_id, first_op) = (first.id, first.op_id);

        // COMPLETE 下直接来新输入，不必先 TURN_COMPLETE
        ctl.submit(Event::UserInput("second".into())).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Complete);
        assert_eq!(ctl.previous_turn().unwrap().id, first_id);
        let second = ctl.turn().unwrap();
        assert_ne!(second.id, first_id);
        assert_eq!(second.input, "second");
        let trail_len = second.history.len();

        let report = ctl
            .submit(Event::Callback {
                op_id: first_op,
                trigger: Trigger::ToolSuccess,
                detail: Some("late result".into()),
            })
            .await
            .unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(ctl.metrics().stale, 1);
        assert_eq!(ctl.state(), TurnState::Complete);
        assert_eq!(ctl.turn().unwrap().history.len(), trail_len);
    }

    #[tokio::test]
    async fn test_tool_failure_retries_then_falls_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(BrokenTool { calls: calls.clone() });
        let plan = Plan::new(Route::Tools(vec![ToolCall::new("broken", json!({}))]))
            .with_fallback(Route::Respond("the backend is down, try later".into()));
        let mut ctl = TurnController::builder(Arc::new(Scripted { plan }), Arc::new(registry)).build();

        ctl.submit(Event::UserInput("call it".into())).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Complete);

        let turn = ctl.turn().unwrap();
        // 首次 + 3 次重试
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(turn.retry_count, 3);
        assert_eq!(
            turn.result,
            Some(TurnResult::Success {
                response: "the backend is down, try later".into()
            })
        );
        let strategies: Vec<_> = turn.recovery_attempts().map(|a| a.strategy).collect();
        assert_eq!(
            strategies,
            vec![
                Strategy::Retry,
                Strategy::Retry,
                Strategy::Retry,
                Strategy::Retry,
                Strategy::Fallback,
            ]
        );
    }

    #[tokio::test]
    async fn test_hallucinated_tool_is_caught_before_execution() {
        let mut ctl = controller(Plan::new(Route::Tools(vec![ToolCall::new("teleport", json!({}))])));
        ctl.submit(Event::UserInput("beam me up".into())).await.unwrap();

        let turn = ctl.turn().unwrap();
        assert!(matches!(turn.result, Some(TurnResult::Degraded { .. })));
        assert!(!turn.trigger_trail().contains(&Trigger::ToolsRouted));
        assert_eq!(ctl.metrics().alerts, 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let mut ctl = controller(Plan::new(Route::Respond("ok".into())));

        let err = ctl.submit(Event::TurnComplete).await.unwrap_err();
        assert!(matches!(
            err,
            ReugError::IllegalTransition {
                state: TurnState::Ready,
                trigger: Trigger::TurnComplete
            }
        ));
        assert_eq!(ctl.state(), TurnState::Ready);
        assert_eq!(ctl.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_events() {
        let mut ctl = controller(Plan::new(Route::Respond("ok".into())));
        ctl.submit(Event::UserInput("hi".into())).await.unwrap();
        ctl.submit(Event::Shutdown).await.unwrap();

        assert_eq!(ctl.state(), TurnState::Shutdown);
        assert!(ctl.turn().is_none());
        assert!(matches!(
            ctl.enqueue(Event::UserInput("again".into())),
            Err(ReugError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_events_from_handle_drain_in_order() {
        let mut ctl = controller(Plan::new(Route::Respond("ok".into())));
        let handle = ctl.handle();
        handle.user_input("one").unwrap();
        handle.turn_complete().unwrap();
        handle.user_input("two").unwrap();

        let report = ctl.drain().await;
        assert_eq!(report.applied, 3);
        assert_eq!(ctl.turn().unwrap().input, "two");
        assert_eq!(ctl.previous_turn().unwrap().input, "one");
        assert_eq!(ctl.metrics().turns_started, 2);
    }

    #[tokio::test]
    async fn test_full_mailbox_trips_breaker() {
        let mut ctl = TurnController::builder(
            Arc::new(Scripted {
                plan: Plan::new(Route::Respond("ok".into())),
            }),
            echo_registry(),
        )
        .with_mailbox_limits(MailboxLimits {
            max_size: 2,
            warning_size: 1,
            breaker_timeout: Duration::from_secs(60),
            ..MailboxLimits::default()
        })
        .build();

        ctl.enqueue(Event::UserInput("a".into())).unwrap();
        ctl.enqueue(Event::UserInput("b".into())).unwrap();
        assert!(ctl.enqueue(Event::UserInput("c".into())).is_err());
        // 熔断期内即使有空位也拒收
        ctl.drain().await;
        assert!(matches!(
            ctl.enqueue(Event::UserInput("d".into())),
            Err(ReugError::CircuitOpen)
        ));

        let metrics = ctl.metrics();
        assert_eq!(metrics.mailbox_rejected, 2);
        assert_eq!(metrics.breaker_trips, 1);
        assert_eq!(metrics.breaker_overflow_trips, 1);
        assert_eq!(metrics.breaker_rate_limit_trips, 0);
        assert_eq!(ctl.turn().unwrap().input, "b");
    }

    #[tokio::test]
    async fn test_spawned_controller_processes_handle_events() {
        let ctl = controller(Plan::new(Route::Respond("ok".into())));
        let (handle, mut snapshots, join) = ctl.spawn();

        handle.user_input("hi").unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.state == TurnState::Complete),
        )
        .await
        .unwrap()
        .unwrap();

        handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), join).await.unwrap().unwrap();
        assert_eq!(snapshots.borrow().state, TurnState::Shutdown);
    }

    #[tokio::test]
    async fn test_drain_continues_past_rejected_entry() {
        let mut ctl = controller(Plan::new(Route::Respond("ok".into())));
        ctl.submit(Event::UserInput("first".into())).await.unwrap();
        let op_id = ctl.turn().unwrap().op_id;

        // 当前 op_id 的回调在 COMPLETE 下不合法；后面排队的输入照常处理
        ctl.enqueue(Event::Callback {
            op_id,
            trigger: Trigger::ToolSuccess,
            detail: None,
        })
        .unwrap();
        ctl.enqueue(Event::UserInput("second".into())).unwrap();

        let report = ctl.drain().await;
        assert_eq!(report.rejected, 1);
        assert_eq!(report.first_rejection, Some((TurnState::Complete, Trigger::ToolSuccess)));
        assert_eq!(report.applied, 1);
        assert_eq!(report.state, TurnState::Complete);
        assert_eq!(ctl.mailbox_len(), 0);
        assert_eq!(ctl.turn().unwrap().input, "second");
        assert_eq!(ctl.metrics().rejected, 1);

        assert!(matches!(
            report.into_result(),
            Err(ReugError::IllegalTransition {
                state: TurnState::Complete,
                trigger: Trigger::ToolSuccess
            })
        ));
    }

    #[tokio::test]
    async fn test_spawned_controller_survives_rejected_callback() {
        let ctl = controller(Plan::new(Route::Respond("ok".into())));
        let metrics = ctl.metrics_handle();
        let (handle, mut snapshots, join) = ctl.spawn();

        handle.user_input("first").unwrap();
        let first = tokio::time::timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.state == TurnState::Complete),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        let (first_turn, first_op) = (first.turn_id.unwrap(), first.op_id.unwrap());

        handle.callback(first_op, Trigger::ToolSuccess).unwrap();
        handle.user_input("second").unwrap();

        let second = tokio::time::timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.state == TurnState::Complete && s.turn_id != Some(first_turn)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(second.mailbox_len, 0);
        assert_eq!(metrics.rejected.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.turns_finished.load(Ordering::SeqCst), 2);

        handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), join).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_input_during_turn_waits_for_completion() {
        let started = Arc::new(Notify::new());
        let mut registry = ToolRegistry::new();
        registry.register(GatedTool {
            started: started.clone(),
        });
        let (telemetry, mut events) = ChannelTelemetry::new();
        let ctl = TurnController::builder(
            Arc::new(Scripted {
                plan: Plan::new(Route::Tools(vec![ToolCall::new("gated", json!({}))])),
            }),
            Arc::new(registry),
        )
        .with_telemetry(Arc::new(telemetry))
        .build();
        let metrics = ctl.metrics_handle();
        let (handle, _snapshots, join) = ctl.spawn();

        handle.user_input("first").unwrap();
        tokio::time::timeout(Duration::from_secs(5), started.notified())
            .await
            .unwrap();
        // 第一回合仍卡在 GENERATE
        assert_eq!(metrics.turns_finished.load(Ordering::SeqCst), 0);
        let producer = handle.clone();
        tokio::spawn(async move { producer.user_input("second") })
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.turns_finished.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), join).await.unwrap().unwrap();

        let mut records: Vec<TransitionRecord> = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TelemetryEvent::Transition(record) = event {
                records.push(record);
            }
        }
        let engages: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.trigger == Trigger::UserInput)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(engages.len(), 2);
        let first_complete = records
            .iter()
            .position(|r| r.state == TurnState::Complete)
            .unwrap();
        assert!(engages[0] < first_complete);
        assert!(first_complete < engages[1]);
        assert_eq!(records[engages[1]].from, TurnState::Complete);
        assert_ne!(records[engages[0]].turn_id, records[engages[1]].turn_id);
        assert_eq!(records[first_complete].turn_id, records[engages[0]].turn_id);

        assert_eq!(metrics.turns_started.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.rejected.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.stale.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.mailbox_rejected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transition_rate_trips_breaker() {
        let mut ctl = TurnController::builder(
            Arc::new(Scripted {
                plan: Plan::new(Route::Respond("ok".into())),
            }),
            echo_registry(),
        )
        .with_mailbox_limits(MailboxLimits {
            transition_rate_limit: 3,
            breaker_timeout: Duration::from_millis(200),
            ..MailboxLimits::default()
        })
        .build();

        // READY -> ENGAGE -> UNDERSTAND -> GENERATE -> COMPLETE：第 4 次转换超限
        ctl.submit(Event::UserInput("hi".into())).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Complete);
        assert!(ctl.turn().unwrap().result.as_ref().unwrap().is_success());

        let metrics = ctl.metrics();
        assert!(metrics.breaker_open);
        assert_eq!(metrics.breaker_rate_limit_trips, 1);
        assert_eq!(metrics.breaker_overflow_trips, 0);
        assert!(matches!(
            ctl.enqueue(Event::TurnComplete),
            Err(ReugError::CircuitOpen)
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        ctl.enqueue(Event::TurnComplete).unwrap();
        assert!(!ctl.metrics().breaker_open);
        assert_eq!(ctl.metrics().mailbox_rejected, 1);
    }

    #[tokio::test]
    async fn test_oversized_batch_falls_back_without_retry() {
        let specs: Vec<_> = (0..11)
            .map(|i| ParallelTaskSpec::new(format!("t{i}"), echo(&format!("p{i}"))))
            .collect();
        let plan = Plan::new(Route::Parallel(specs)).with_fallback(Route::Respond("too many tasks".into()));
        let mut ctl = controller(plan);

        ctl.submit(Event::UserInput("fan out wide".into())).await.unwrap();
        assert_eq!(ctl.state(), TurnState::Complete);

        let turn = ctl.turn().unwrap();
        assert_eq!(
            turn.result,
            Some(TurnResult::Success {
                response: "too many tasks".into()
            })
        );
        assert!(turn.parallel_tasks.is_empty());
        assert_eq!(turn.retry_count, 0);
        let attempts: Vec<_> = turn.recovery_attempts().collect();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error_kind, ErrorKind::BatchRejected);
        assert_eq!(attempts[0].strategy, Strategy::Fallback);
    }
}
