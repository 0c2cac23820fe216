use std::collections::HashSet;
use std::thread;

use batched_bridge::queue::{default_fault_handler, QueueThread, ShutdownPolicy};
use batched_bridge::ui::{
    RenderError, UiBatch, UiBatchSink, UiCommandSink, UiOperation, ViewRenderer, ViewTag,
};

/// Records every call and rejects updates to views it never created.
#[derive(Default)]
struct RecordingRenderer {
    views: HashSet<ViewTag>,
    log: Vec<String>,
    threads: Vec<Option<String>>,
}

impl RecordingRenderer {
    fn record(&mut self, entry: String) {
        self.threads.push(thread::current().name().map(str::to_string));
        self.log.push(entry);
    }

    fn require(&self, tag: ViewTag) -> Result<(), RenderError> {
        if self.views.contains(&tag) {
            Ok(())
        } else {
            Err(RenderError::StaleView(tag))
        }
    }
}

impl ViewRenderer<&'static str> for RecordingRenderer {
    fn create_view(&mut self, tag: ViewTag, payload: &'static str) -> Result<(), RenderError> {
        self.views.insert(tag);
        self.record(format!("create {tag} {payload}"));
        Ok(())
    }

    fn set_children(&mut self, parent: ViewTag, children: &[ViewTag]) -> Result<(), RenderError> {
        self.require(parent)?;
        self.record(format!("children {parent} {children:?}"));
        Ok(())
    }

    fn remove_view(&mut self, tag: ViewTag) -> Result<(), RenderError> {
        self.require(tag)?;
        self.views.remove(&tag);
        self.record(format!("remove {tag}"));
        Ok(())
    }

    fn update_props(&mut self, tag: ViewTag, payload: &'static str) -> Result<(), RenderError> {
        self.require(tag)?;
        self.record(format!("props {tag} {payload}"));
        Ok(())
    }

    fn update_layout(&mut self, tag: ViewTag, payload: &'static str) -> Result<(), RenderError> {
        self.require(tag)?;
        self.record(format!("layout {tag} {payload}"));
        Ok(())
    }

    fn update_extra_data(&mut self, tag: ViewTag, payload: &'static str) -> Result<(), RenderError> {
        self.require(tag)?;
        self.record(format!("extra {tag} {payload}"));
        Ok(())
    }
}

fn rendering_lane() -> QueueThread {
    QueueThread::start("rendering", default_fault_handler()).expect("rendering lane")
}

#[test]
fn children_materialize_before_layout_and_apply_bottom_up() {
    let lane = rendering_lane();
    let sink = UiCommandSink::new(RecordingRenderer::default(), lane.queue());

    let batch = UiBatch::new(vec![
        UiOperation::Create { tag: 1, payload: "root" },
        UiOperation::UpdateLayout { tag: 1, payload: "fill" },
        UiOperation::Create { tag: 2, payload: "row" },
        UiOperation::Create { tag: 3, payload: "text" },
        UiOperation::ManageChildren { parent: 1, children: vec![2] },
        UiOperation::UpdateProps { tag: 2, payload: "red" },
        UiOperation::ManageChildren { parent: 2, children: vec![3] },
        UiOperation::UpdateLayout { tag: 3, payload: "wrap" },
        UiOperation::UpdateLayout { tag: 2, payload: "row-size" },
        UiOperation::UpdateExtraData { tag: 3, payload: "runs" },
    ]);
    let report = sink.apply(batch);

    assert!(report.is_clean());
    assert_eq!(report.applied, 10);
    let log = sink.with_renderer(|renderer| renderer.log.clone());
    assert_eq!(
        log,
        vec![
            "create 1 root",
            "create 2 row",
            "create 3 text",
            "children 1 [2]",
            "children 2 [3]",
            "layout 3 wrap",
            "extra 3 runs",
            "props 2 red",
            "layout 2 row-size",
            "layout 1 fill",
        ]
    );
    lane.shutdown(ShutdownPolicy::Drain);
}

#[test]
fn siblings_keep_production_order() {
    let lane = rendering_lane();
    let sink = UiCommandSink::new(RecordingRenderer::default(), lane.queue());

    sink.apply(UiBatch::new(vec![
        UiOperation::Create { tag: 1, payload: "root" },
        UiOperation::Create { tag: 5, payload: "b" },
        UiOperation::Create { tag: 4, payload: "a" },
        UiOperation::ManageChildren { parent: 1, children: vec![4, 5] },
    ]));
    let report = sink.apply(UiBatch::new(vec![
        UiOperation::UpdateLayout { tag: 5, payload: "second" },
        UiOperation::UpdateLayout { tag: 4, payload: "first" },
        UiOperation::UpdateProps { tag: 5, payload: "again" },
    ]));

    assert_eq!(report.applied, 3);
    let log = sink.with_renderer(|renderer| renderer.log[4..].to_vec());
    assert_eq!(log, vec!["layout 5 second", "props 5 again", "layout 4 first"]);
    lane.shutdown(ShutdownPolicy::Drain);
}

#[test]
fn stale_views_are_reported_and_the_batch_continues() {
    let lane = rendering_lane();
    let sink = UiCommandSink::new(RecordingRenderer::default(), lane.queue());

    let report = sink.apply(UiBatch::new(vec![
        UiOperation::Create { tag: 1, payload: "root" },
        UiOperation::Remove { tag: 9 },
        UiOperation::UpdateProps { tag: 8, payload: "lost" },
        UiOperation::UpdateProps { tag: 1, payload: "kept" },
    ]));

    assert_eq!(report.applied, 2);
    let failed: Vec<ViewTag> = report.failures.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(failed, vec![9, 8]);
    assert!(matches!(report.failures[1].1, RenderError::StaleView(8)));
    let log = sink.with_renderer(|renderer| renderer.log.clone());
    assert_eq!(log, vec!["create 1 root", "props 1 kept"]);
    lane.shutdown(ShutdownPolicy::Drain);
}

#[test]
fn removed_subtrees_no_longer_count_for_depth() {
    let lane = rendering_lane();
    let sink = UiCommandSink::new(RecordingRenderer::default(), lane.queue());

    sink.apply(UiBatch::new(vec![
        UiOperation::Create { tag: 1, payload: "root" },
        UiOperation::Create { tag: 2, payload: "child" },
        UiOperation::ManageChildren { parent: 1, children: vec![2] },
        UiOperation::Remove { tag: 2 },
        UiOperation::Create { tag: 2, payload: "reborn" },
        UiOperation::Create { tag: 3, payload: "other" },
        UiOperation::ManageChildren { parent: 1, children: vec![3] },
    ]));
    // 2 is a detached root again and sorts after 3
    let report = sink.apply(UiBatch::new(vec![
        UiOperation::UpdateLayout { tag: 2, payload: "detached" },
        UiOperation::UpdateLayout { tag: 3, payload: "attached" },
    ]));

    assert!(report.is_clean());
    let log = sink.with_renderer(|renderer| renderer.log[7..].to_vec());
    assert_eq!(log, vec!["layout 3 attached", "layout 2 detached"]);
    lane.shutdown(ShutdownPolicy::Drain);
}

#[test]
fn dispatch_applies_on_the_rendering_lane() {
    let lane = rendering_lane();
    let sink = UiCommandSink::new(RecordingRenderer::default(), lane.queue());

    sink.dispatch(UiBatch::new(vec![
        UiOperation::Create { tag: 1, payload: "root" },
        UiOperation::UpdateProps { tag: 1, payload: "blue" },
    ]))
    .expect("dispatch");
    sink.dispatch(UiBatch::new(Vec::new())).expect("empty dispatch");
    lane.call(|_| ()).expect("barrier");

    let (log, threads) = sink.with_renderer(|renderer| (renderer.log.clone(), renderer.threads.clone()));
    assert_eq!(log, vec!["create 1 root", "props 1 blue"]);
    assert!(threads.iter().all(|name| name.as_deref() == Some("rendering")));
    lane.shutdown(ShutdownPolicy::Drain);
}

#[test]
fn updates_produced_before_a_remove_apply_first() {
    let lane = rendering_lane();
    let sink = UiCommandSink::new(RecordingRenderer::default(), lane.queue());

    sink.apply(UiBatch::new(vec![
        UiOperation::Create { tag: 1, payload: "root" },
        UiOperation::Create { tag: 5, payload: "panel" },
        UiOperation::Create { tag: 6, payload: "label" },
        UiOperation::ManageChildren { parent: 1, children: vec![5] },
        UiOperation::ManageChildren { parent: 5, children: vec![6] },
    ]));
    let report = sink.apply(UiBatch::new(vec![
        UiOperation::UpdateProps { tag: 5, payload: "last-props" },
        UiOperation::UpdateLayout { tag: 6, payload: "last-layout" },
        UiOperation::UpdateLayout { tag: 1, payload: "fill" },
        UiOperation::Remove { tag: 5 },
        UiOperation::UpdateProps { tag: 1, payload: "after" },
    ]));

    assert!(report.is_clean(), "failures: {:?}", report.failures);
    assert_eq!(report.applied, 5);
    let log = sink.with_renderer(|renderer| renderer.log[5..].to_vec());
    assert_eq!(
        log,
        vec![
            "layout 6 last-layout",
            "props 5 last-props",
            "layout 1 fill",
            "remove 5",
            "props 1 after",
        ]
    );
    lane.shutdown(ShutdownPolicy::Drain);
}

#[test]
fn single_node_update_then_remove_keeps_production_order() {
    let lane = rendering_lane();
    let sink = UiCommandSink::new(RecordingRenderer::default(), lane.queue());

    sink.apply(UiBatch::new(vec![UiOperation::Create { tag: 5, payload: "view" }]));
    let report = sink.apply(UiBatch::new(vec![
        UiOperation::UpdateProps { tag: 5, payload: "last-props" },
        UiOperation::Remove { tag: 5 },
    ]));

    assert!(report.is_clean());
    let log = sink.with_renderer(|renderer| renderer.log.clone());
    assert_eq!(log, vec!["create 5 view", "props 5 last-props", "remove 5"]);
    lane.shutdown(ShutdownPolicy::Drain);
}
