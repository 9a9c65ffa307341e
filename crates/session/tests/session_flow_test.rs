//! End-to-end session scenarios against an in-memory executor.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use drilldown_analysis::binding::BindingKey;
    use drilldown_analysis::funnel::{FunnelStatus, FunnelStep};
    use drilldown_core::executor::{rows_from_json, CaptureExecutor, ExecutorRequest};
    use drilldown_core::filter::{FilterNode, FilterOperator};
    use drilldown_core::flow_query::FlowStartingStep;
    use drilldown_core::{AppConfig, Query};
    use drilldown_session::{AnalysisMode, AnalysisOutput, AnalysisSession, ExecutionStatus};
    use serde_json::json;

    fn step(name: &str, measure: &str) -> FunnelStep {
        FunnelStep::new(
            name,
            Query {
                measures: vec![measure.to_string()],
                ..Default::default()
            },
        )
    }

    /// Signup → Activate → Purchase with users u1..u3 dropping off.
    fn funnel_executor() -> Arc<CaptureExecutor> {
        Arc::new(CaptureExecutor::new(|request| {
            let ExecutorRequest::Query(query) = request else {
                return Ok(Vec::new());
            };
            let users = match query.measures[0].as_str() {
                "Events.signups" => json!([{"Events.userId": "u1"}, {"Events.userId": "u2"}, {"Events.userId": "u3"}]),
                "Events.activations" => json!([{"Events.userId": "u1"}, {"Events.userId": "u2"}]),
                _ => json!([{"Events.userId": "u1"}]),
            };
            rows_from_json(users)
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_funnel_session_end_to_end() {
        let executor = funnel_executor();
        let mut session = AnalysisSession::new(executor.clone(), AppConfig::default());
        session.set_mode(AnalysisMode::Funnel);
        session
            .set_funnel_binding_key(Some(BindingKey::single("Events.userId")))
            .unwrap();
        session.add_funnel_step(step("Signup", "Events.signups")).unwrap();
        session.add_funnel_step(step("Activate", "Events.activations")).unwrap();
        session.add_funnel_step(step("Purchase", "Events.purchases")).unwrap();
        assert!(session.validation_errors().is_empty());

        let snapshot = session.settled().await;
        assert_eq!(snapshot.status, ExecutionStatus::Success);
        let Some(AnalysisOutput::Funnel(result)) = snapshot.output else {
            panic!("expected funnel output");
        };
        assert_eq!(result.status, FunnelStatus::Success);
        let counts: Vec<u64> = result.steps.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![3, 2, 1]);
        // one debounced run of three sequential steps
        assert_eq!(executor.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reordering_steps_reruns_with_new_order() {
        let executor = funnel_executor();
        let mut session = AnalysisSession::new(executor.clone(), AppConfig::default());
        session.set_mode(AnalysisMode::Funnel);
        session
            .set_funnel_binding_key(Some(BindingKey::single("Events.userId")))
            .unwrap();
        session.add_funnel_step(step("Signup", "Events.signups")).unwrap();
        session.add_funnel_step(step("Purchase", "Events.purchases")).unwrap();
        session.settled().await;
        executor.clear();

        session.move_funnel_step(1, 0).unwrap();
        session.settled().await;
        let queries = executor.queries();
        assert_eq!(queries[0].measures, vec!["Events.purchases"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_session_builds_graph() {
        let executor = Arc::new(CaptureExecutor::new(|request| match request {
            ExecutorRequest::FlowLayer(r) if r.layer == 0 => rows_from_json(json!([{"count": 100}])),
            ExecutorRequest::FlowLayer(_) => rows_from_json(json!([
                {"path": ["Checkout"], "count": 60},
                {"path": ["Refund"], "count": 40}
            ])),
            ExecutorRequest::Query(_) => Ok(Vec::new()),
        }));
        let mut session = AnalysisSession::new(executor, AppConfig::default());
        session.set_mode(AnalysisMode::Flow);
        session.set_flow_cube(Some("Events".into())).unwrap();
        session.set_flow_binding_key(Some("Events.userId".into())).unwrap();
        session.set_flow_time_dimension(Some("Events.timestamp".into())).unwrap();
        session.set_flow_event_dimension(Some("Events.name".into())).unwrap();
        session.set_flow_steps_after(1).unwrap();
        assert_eq!(session.status(), ExecutionStatus::Idle);

        session
            .set_flow_starting_step(FlowStartingStep {
                name: "Purchase".into(),
                filters: vec![FilterNode::simple(
                    "Events.name",
                    FilterOperator::Equals,
                    vec!["Purchase".into()],
                )],
            })
            .unwrap();
        let snapshot = session.settled().await;
        let Some(AnalysisOutput::Flow(graph)) = snapshot.output else {
            panic!("expected flow output");
        };
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.links.iter().map(|l| l.value).sum::<u64>(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_then_reconfigure_shows_only_new_results() {
        let executor = funnel_executor();
        let mut session = AnalysisSession::new(executor.clone(), AppConfig::default());
        session
            .set_metrics(vec![drilldown_core::MetricItem::new("Events.signups")])
            .unwrap();
        session.clear_mode();
        session
            .set_metrics(vec![drilldown_core::MetricItem::new("Events.activations")])
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        match session.output() {
            Some(AnalysisOutput::Query { query, rows, .. }) => {
                assert_eq!(query.measures, vec!["Events.activations"]);
                assert_eq!(rows.len(), 2);
            }
            other => panic!("unexpected output {other:?}"),
        }
        assert_eq!(executor.count(), 1);
    }
}
