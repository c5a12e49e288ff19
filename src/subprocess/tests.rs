#[cfg(test)]
mod tests {
    use super::super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    fn cmd(word: &str) -> ToolCommand {
        ToolCommandBuilder::new([word]).build()
    }

    fn channel(mock: &MockWorkerLauncher) -> WorkerChannel {
        WorkerChannel::new(Arc::new(mock.clone()), WorkerSettings::default())
    }

    fn first_words(mock: &MockWorkerLauncher) -> Vec<(usize, String)> {
        mock.requests()
            .into_iter()
            .map(|(n, tokens)| (n, tokens[0].clone()))
            .collect()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Answers "a" only once the returned gate is notified.
    fn gated_on_a() -> (MockWorkerLauncher, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let handler_gate = Arc::clone(&gate);
        let mock = MockWorkerLauncher::new(move |tokens| {
            if tokens[0] == "a" {
                FakeReply::Gated {
                    gate: Arc::clone(&handler_gate),
                    response: "A".to_string(),
                }
            } else {
                FakeReply::Respond(tokens[0].to_uppercase())
            }
        });
        (mock, gate)
    }

    #[tokio::test]
    async fn test_request_carries_logging_flags() {
        let mock = MockWorkerLauncher::echo();
        let serializer = CommandSerializer::new(channel(&mock));

        let command = ToolCommandBuilder::new(["resolve", "ram"]).arg("x").build();
        let response = serializer.submit(command).await.unwrap();
        assert_eq!(response, "resolve ram -v --log-to-stderr x");
    }

    #[tokio::test]
    async fn test_commands_run_in_submission_order() {
        let mock = MockWorkerLauncher::echo();
        let serializer = CommandSerializer::new(channel(&mock));

        let a = serializer.submit(cmd("a"));
        let b = serializer.submit(cmd("b"));
        let c = serializer.submit(cmd("c"));
        let (a, b, c) = tokio::join!(a, b, c);

        assert!(a.unwrap().starts_with('a'));
        assert!(b.unwrap().starts_with('b'));
        assert!(c.unwrap().starts_with('c'));
        assert_eq!(
            first_words(&mock),
            vec![(1, "a".to_string()), (1, "b".to_string()), (1, "c".to_string())]
        );
        assert_eq!(mock.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_never_more_than_one_outstanding_request() {
        let mock = MockWorkerLauncher::new(|tokens| {
            FakeReply::Chunks(vec![
                tokens[0].as_bytes().to_vec(),
                b"-part".to_vec(),
                b"\0".to_vec(),
            ])
        });
        let serializer = Arc::new(CommandSerializer::new(channel(&mock)));

        let mut handles = Vec::new();
        for i in 0..20 {
            let serializer = Arc::clone(&serializer);
            handles.push(tokio::spawn(async move {
                serializer.submit(cmd(&format!("w{i}"))).await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), format!("w{i}-part"));
        }

        assert_eq!(mock.max_outstanding(), 1);
        assert_eq!(mock.requests().len(), 20);
    }

    #[tokio::test]
    async fn test_response_split_across_chunks() {
        let mock = MockWorkerLauncher::new(|_| {
            FakeReply::Chunks(vec![b"{\"ok\":".to_vec(), b"true}\0".to_vec()])
        });
        let serializer = CommandSerializer::new(channel(&mock));
        assert_eq!(serializer.submit(cmd("x")).await.unwrap(), "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_restart_runs_before_queued_commands() {
        let (mock, gate) = gated_on_a();
        let restarts = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&restarts);
        let serializer = CommandSerializer::with_restart_hook(
            channel(&mock),
            Box::new(move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let a = serializer.submit(cmd("a"));
        wait_for(|| !mock.requests().is_empty()).await;

        let b = serializer.submit(cmd("b"));
        let c = serializer.submit(cmd("c"));
        serializer.restart().unwrap();
        gate.notify_one();

        assert_eq!(a.await.unwrap(), "A");
        assert_eq!(b.await.unwrap(), "B");
        assert_eq!(c.await.unwrap(), "C");

        let lifecycle: Vec<MockEvent> = mock
            .events()
            .into_iter()
            .filter(|event| !matches!(event, MockEvent::Shutdown(_)))
            .map(|event| match event {
                MockEvent::Request(n, tokens) => MockEvent::Request(n, vec![tokens[0].clone()]),
                other => other,
            })
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                MockEvent::Launched(1),
                MockEvent::Request(1, vec!["a".to_string()]),
                MockEvent::Killed(1),
                MockEvent::Launched(2),
                MockEvent::Request(2, vec!["b".to_string()]),
                MockEvent::Request(2, vec!["c".to_string()]),
            ]
        );
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_when_idle_relaunches_lazily() {
        let mock = MockWorkerLauncher::echo();
        let serializer = CommandSerializer::new(channel(&mock));

        serializer.submit(cmd("a")).await.unwrap();
        serializer.restart().unwrap();
        serializer.submit(cmd("b")).await.unwrap();

        assert_eq!(mock.launch_count(), 2);
        assert!(mock.events().contains(&MockEvent::Killed(1)));
    }

    #[tokio::test]
    async fn test_crash_fails_only_the_in_flight_command() {
        let mock = MockWorkerLauncher::new(|tokens| {
            if tokens[0] == "crash" {
                FakeReply::Crash {
                    stderr: "A fatal error occurred: out of memory\n".to_string(),
                    code: 2,
                }
            } else {
                FakeReply::Respond("fine".to_string())
            }
        });
        let serializer = CommandSerializer::new(channel(&mock));

        let crashed = serializer.submit(cmd("crash"));
        let after = serializer.submit(cmd("after"));

        let err = crashed.await.unwrap_err();
        match &err {
            ProcessError::NonZeroExit(failure) => {
                assert_eq!(failure.exit_code(), Some(2));
                assert!(failure.stderr.contains("out of memory"));
                assert_eq!(failure.command_line[0], "crash");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
        assert!(err.to_string().contains("out of memory"));

        assert_eq!(after.await.unwrap(), "fine");
        assert_eq!(mock.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported_and_retried() {
        let mock = MockWorkerLauncher::echo();
        mock.fail_next_launch();
        let serializer = CommandSerializer::new(channel(&mock));

        let err = serializer.submit(cmd("a")).await.unwrap_err();
        assert!(matches!(err, ProcessError::LaunchFailed { .. }));

        assert!(serializer.submit(cmd("b")).await.is_ok());
        assert_eq!(mock.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let mock = MockWorkerLauncher::echo();
        let serializer = CommandSerializer::new(channel(&mock));
        let token = CancellationToken::new();
        token.cancel();

        let err = serializer
            .submit_cancellable(cmd("a"), token)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(mock.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_commands() {
        let (mock, gate) = gated_on_a();
        let serializer = CommandSerializer::new(channel(&mock));

        let a = serializer.submit(cmd("a"));
        wait_for(|| !mock.requests().is_empty()).await;
        let b = serializer.submit(cmd("b"));

        tokio::join!(serializer.shutdown(), async {
            gate.notify_one();
        });

        assert_eq!(a.await.unwrap(), "A");
        assert!(matches!(b.await, Err(ProcessError::ServerClosed)));
        assert!(matches!(
            serializer.submit(cmd("c")).await,
            Err(ProcessError::ServerClosed)
        ));
        assert!(serializer.is_closed());
        assert!(mock.events().contains(&MockEvent::Killed(1)));
    }

    #[tokio::test]
    async fn test_dropping_serializer_stops_worker() {
        let mock = MockWorkerLauncher::echo();
        let serializer = CommandSerializer::new(channel(&mock));
        serializer.submit(cmd("a")).await.unwrap();
        drop(serializer);

        wait_for(|| mock.events().contains(&MockEvent::Killed(1))).await;
    }

    #[tokio::test]
    async fn test_worker_state_transitions() {
        let mock = MockWorkerLauncher::new(|tokens| {
            if tokens[0] == "crash" {
                FakeReply::Crash {
                    stderr: String::new(),
                    code: 1,
                }
            } else {
                FakeReply::Respond("ok".to_string())
            }
        });
        let mut channel = channel(&mock);
        assert_eq!(channel.state(), WorkerState::Unstarted);

        channel.dispatch(&cmd("a")).await.unwrap();
        assert_eq!(channel.state(), WorkerState::Ready);

        assert!(channel.dispatch(&cmd("crash")).await.is_err());
        assert_eq!(channel.state(), WorkerState::Failed);

        channel.dispatch(&cmd("b")).await.unwrap();
        assert_eq!(channel.state(), WorkerState::Ready);
        assert_eq!(mock.launch_count(), 2);

        channel.teardown().await;
        assert_eq!(channel.state(), WorkerState::Unstarted);
        assert!(mock.events().contains(&MockEvent::Killed(2)));
    }

    #[tokio::test]
    async fn test_clean_exit_mid_command_is_protocol_violation() {
        let mock = MockWorkerLauncher::new(|_| FakeReply::Crash {
            stderr: "bye\n".to_string(),
            code: 0,
        });
        let mut channel = channel(&mock);

        let err = channel.dispatch(&cmd("a")).await.unwrap_err();
        assert!(matches!(err, ProcessError::ProtocolViolation(_)));
        assert_eq!(err.failure().map(|f| f.stderr.as_str()), Some("bye\n"));
    }
}
