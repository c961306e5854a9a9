//! Persistence and recovery tests for the durable graph store.
//!
//! These tests verify that types, counters, shards and allocator state
//! survive a session restart (close + reopen on the same data directory).

use std::sync::Arc;

use akh_batchgraph::commit_log::{CommitLog, CommitLogSink, DiscardSink, JsonLinesSink};
use akh_batchgraph::concept::{DataType, TypeLabel};
use akh_batchgraph::config::GraphConfig;
use akh_batchgraph::registry::MetaKind;
use akh_batchgraph::repair::{RepairDriver, RepairQueue};
use akh_batchgraph::session::Session;
use akh_batchgraph::store::GraphStore;

fn durable_session(dir: &std::path::Path, sink: Arc<dyn CommitLogSink>) -> Session {
    let config = GraphConfig::in_memory("durable")
        .with_batch(true)
        .with_data_dir(dir)
        .with_shard_threshold(3);
    Session::open(config, sink).unwrap()
}

#[test]
fn types_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    let person_id;
    {
        let session = durable_session(dir.path(), Arc::new(DiscardSink));
        let mut graph = session.graph().unwrap();
        person_id = graph.put_entity_type("person").unwrap().type_id();
        graph.put_resource_type("name", DataType::String).unwrap();
        graph.commit().unwrap();
    }

    {
        let session = durable_session(dir.path(), Arc::new(DiscardSink));
        let registry = session.registry();
        assert_eq!(registry.len(), MetaKind::ALL.len() + 2);

        let person = registry.get(&TypeLabel::new("person")).unwrap();
        assert_eq!(person.type_id(), person_id);
        assert_eq!(person.kind(), MetaKind::Entity);

        let name = registry.get(&TypeLabel::new("name")).unwrap();
        assert_eq!(name.data_type(), Some(DataType::String));

        // New types continue after the restored ones.
        let mut graph = session.graph().unwrap();
        let place = graph.put_entity_type("place").unwrap();
        assert!(place.type_id() > name.type_id().max(person.type_id()));
        graph.commit().unwrap();
    }
}

#[test]
fn meta_types_are_bootstrapped_once() {
    let dir = tempfile::TempDir::new().unwrap();

    let vertices = {
        let session = durable_session(dir.path(), Arc::new(DiscardSink));
        session.store().vertex_count().unwrap()
    };
    let session = durable_session(dir.path(), Arc::new(DiscardSink));
    assert_eq!(session.store().vertex_count().unwrap(), vertices);
}

#[test]
fn counters_and_shards_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let label = TypeLabel::new("person");

    {
        let queue = Arc::new(RepairQueue::new());
        let session = durable_session(dir.path(), queue.clone());
        let mut graph = session.graph().unwrap();
        graph.put_entity_type("person").unwrap();
        graph.commit().unwrap();

        let mut graph = session.graph().unwrap();
        for _ in 0..4 {
            graph.add_entity(&label).unwrap();
        }
        graph.commit().unwrap();

        let stats = RepairDriver::new(session.clone(), queue).run_once().unwrap();
        assert_eq!(stats.shards_created, 1);
    }

    {
        let session = durable_session(dir.path(), Arc::new(DiscardSink));
        let person = session.registry().get(&label).unwrap();
        assert_eq!(session.counts().count_of(&person).unwrap(), 4);

        let shards = session.sharding().shards(person.concept_id()).unwrap();
        assert_eq!(shards.len(), 2);
        let current = session
            .store()
            .get_vertex(person.concept_id())
            .unwrap()
            .unwrap();
        assert_eq!(current.shard_generation(), 1);
        assert_eq!(current.current_shard(), shards.last().copied());

        // Already at generation 1: nothing more to do.
        assert!(!session.sharding().shard(person.concept_id()).unwrap());
    }
}

#[test]
fn id_allocation_resumes_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    let last = {
        let session = durable_session(dir.path(), Arc::new(DiscardSink));
        let mut graph = session.graph().unwrap();
        graph.put_entity_type("person").unwrap();
        graph.commit().unwrap();

        let mut graph = session.graph().unwrap();
        let id = graph.add_entity(&TypeLabel::new("person")).unwrap();
        graph.commit().unwrap();
        id
    };

    let session = durable_session(dir.path(), Arc::new(DiscardSink));
    let mut graph = session.graph().unwrap();
    let next = graph.add_entity(&TypeLabel::new("person")).unwrap();
    assert!(next > last);
    graph.commit().unwrap();
    assert!(session.store().get_vertex(last).unwrap().is_some());
}

#[test]
fn commit_logs_written_to_disk_can_be_replayed() {
    let dir = tempfile::TempDir::new().unwrap();
    let log_path = dir.path().join("commit-logs.jsonl");

    {
        let sink = Arc::new(JsonLinesSink::open(&log_path).unwrap());
        let session = durable_session(dir.path(), sink);
        let mut graph = session.graph().unwrap();
        graph.put_resource_type("name", DataType::String).unwrap();
        graph.commit().unwrap();

        for _ in 0..2 {
            let mut graph = session.graph().unwrap();
            graph.put_resource(&TypeLabel::new("name"), "Ada").unwrap();
            graph.commit().unwrap();
        }
    }

    let logs: Vec<CommitLog> = JsonLinesSink::read_all(&log_path)
        .unwrap()
        .into_iter()
        .filter(|log| !log.is_empty())
        .collect();
    assert_eq!(logs.len(), 2);

    let queue = Arc::new(RepairQueue::new());
    let session = durable_session(dir.path(), queue.clone());
    let driver = RepairDriver::new(session.clone(), queue);
    for log in logs {
        driver.submit(log).unwrap();
    }
    let stats = driver.run_once().unwrap();
    assert_eq!(stats.vertices_merged, 1);

    let name = session.registry().get(&TypeLabel::new("name")).unwrap();
    assert_eq!(session.counts().count_of(&name).unwrap(), 1);
}
