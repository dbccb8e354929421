use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::EngineEvent;
use uuid::Uuid;

fn started(title: &str) -> EngineEvent {
    EngineEvent::ActionStarted {
        action_id: Uuid::new_v4(),
        goal_id: None,
        title: title.to_string(),
    }
}

fn goal_done() -> EngineEvent {
    EngineEvent::GoalCompleted {
        goal_id: Uuid::new_v4(),
        title: "ship it".into(),
    }
}

#[test]
fn test_new_bus_has_no_subscribers() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_publish_delivers_to_every_subscriber() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();

    bus.publish(goal_done());

    assert!(matches!(rx1.try_recv().unwrap(), EngineEvent::GoalCompleted { .. }));
    assert!(matches!(rx2.try_recv().unwrap(), EngineEvent::GoalCompleted { .. }));
}

#[test]
fn test_dropped_receiver_is_pruned() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    drop(rx1);
    // Publish triggers pruning of disconnected senders.
    bus.publish(started("a"));
    assert_eq!(bus.subscriber_count(), 1);
    assert!(rx2.try_recv().is_ok());
}

#[test]
fn test_events_arrive_in_publish_order() {
    let bus = EventBus::new();
    let rx = bus.subscribe();

    bus.publish(started("first"));
    bus.publish(goal_done());

    assert_eq!(rx.try_recv().unwrap().name(), "action-started");
    assert_eq!(rx.try_recv().unwrap().name(), "goal-completed");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_subscriber_does_not_receive_earlier_events() {
    let bus = EventBus::new();
    bus.publish(started("early"));
    let rx = bus.subscribe();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_clones_share_subscribers() {
    let bus = EventBus::new();
    let clone = bus.clone();
    let rx = bus.subscribe();
    clone.publish(started("via clone"));
    assert!(rx.try_recv().is_ok());
    assert_eq!(clone.subscriber_count(), 1);
}

#[tokio::test]
async fn test_async_receive() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let publisher = bus.clone();
    tokio::spawn(async move {
        publisher.publish(started("async"));
    });
    let ev = rx.recv_async().await.expect("event");
    assert_eq!(ev.name(), "action-started");
}
