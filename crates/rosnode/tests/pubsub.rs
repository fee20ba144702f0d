// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test readability
#![allow(clippy::cast_possible_truncation)] // Test data conversions

//! Topic integration tests: real loopback TCPROS between nodes registered
//! with an in-process master.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{wait_until, FakeMaster};
use parking_lot::Mutex;
use rosnode::msgs::StringMsg;
use rosnode::xmlrpc::{parse_http_uri, HandlerTable, Value, XmlRpcClient, XmlRpcServer};
use rosnode::{Error, Node, Result, RosMessage, RosReader, RosWriter, SubscriberOptions};

const WAIT: Duration = Duration::from_secs(5);

/// Same topic, different schema than `std_msgs/String`.
#[derive(Clone, Debug, Default, PartialEq)]
struct Counter {
    value: u32,
}

impl RosMessage for Counter {
    fn msg_type() -> String {
        "test_msgs/Counter".to_string()
    }

    fn md5sum() -> String {
        "f6a1e8f4a5b7c3d2e1f0a9b8c7d6e5f4".to_string()
    }

    fn encode(&self, w: &mut RosWriter) {
        w.write_u32(self.value);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self { value: r.read_u32()? })
    }
}

fn collector() -> (Arc<Mutex<Vec<String>>>, impl Fn(Arc<StringMsg>) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |msg: Arc<StringMsg>| sink.lock().push(msg.data.clone()))
}

#[test]
fn test_register_publisher_call() {
    let master = FakeMaster::start();
    let node = Node::new("talker", master.config()).unwrap();
    let _chatter = node.advertise::<StringMsg>("chatter", 10, false).unwrap();

    let calls = master.calls_to("registerPublisher");
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        vec![
            Value::from("/talker"),
            Value::from("/chatter"),
            Value::from("std_msgs/String"),
            Value::from(node.uri()),
        ]
    );
    assert_eq!(master.publishers_of("/chatter"), vec!["/talker".to_string()]);
}

#[test]
fn test_tcp_pubsub_in_order() {
    let master = FakeMaster::start();
    let talker = Node::new("talker", master.config()).unwrap();
    let listener = Node::new("listener", master.config()).unwrap();
    let mut spinner = listener.async_spinner(1);
    spinner.start().unwrap();

    let (seen, callback) = collector();
    let sub = listener.subscribe::<StringMsg, _>("/chatter", 10, callback).unwrap();
    let chatter = talker.advertise::<StringMsg>("/chatter", 10, false).unwrap();

    assert!(wait_until(WAIT, || chatter.num_subscribers() == 1));
    assert!(wait_until(WAIT, || sub.num_publishers() == 1));
    assert_eq!(chatter.subscriber_names(), vec!["/listener".to_string()]);
    assert_eq!(sub.publisher_names(), vec!["/talker".to_string()]);

    for i in 0..5 {
        chatter.publish(StringMsg::new(format!("hello {}", i))).unwrap();
    }
    assert!(wait_until(WAIT, || seen.lock().len() == 5));
    let expected: Vec<String> = (0..5).map(|i| format!("hello {}", i)).collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_intraprocess_pubsub() {
    let master = FakeMaster::start();
    let node = Node::new("loopback", master.config()).unwrap();
    let (seen, callback) = collector();
    let chatter = node.advertise::<StringMsg>("chatter", 10, false).unwrap();
    let sub = node.subscribe::<StringMsg, _>("chatter", 10, callback).unwrap();

    assert!(wait_until(WAIT, || chatter.num_subscribers() == 1));
    chatter.publish(StringMsg::new("local")).unwrap();
    assert!(wait_until(WAIT, || {
        node.spin_once();
        !seen.lock().is_empty()
    }));
    assert_eq!(*seen.lock(), vec!["local".to_string()]);
    assert_eq!(sub.num_publishers(), 1);
}

#[test]
fn test_latched_late_subscriber_gets_last_message() {
    let master = FakeMaster::start();
    let talker = Node::new("talker", master.config()).unwrap();
    let chatter = talker.advertise::<StringMsg>("/latched", 10, true).unwrap();
    assert!(chatter.is_latched());
    for data in ["a", "b", "c"] {
        chatter.publish(StringMsg::new(data)).unwrap();
    }

    let listener = Node::new("listener", master.config()).unwrap();
    let mut spinner = listener.async_spinner(1);
    spinner.start().unwrap();
    let (seen, callback) = collector();
    let _sub = listener.subscribe::<StringMsg, _>("/latched", 10, callback).unwrap();

    assert!(wait_until(WAIT, || !seen.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(*seen.lock(), vec!["c".to_string()]);
}

#[test]
fn test_md5_mismatch_rejected() {
    let master = FakeMaster::start();
    let talker = Node::new("talker", master.config()).unwrap();
    let listener = Node::new("listener", master.config()).unwrap();
    let mut spinner = listener.async_spinner(1);
    spinner.start().unwrap();

    let (seen, callback) = collector();
    let sub = listener.subscribe::<StringMsg, _>("/mixed", 10, callback).unwrap();
    let counter = talker.advertise::<Counter>("/mixed", 10, false).unwrap();
    // Wait until the publisher is known, then give negotiation time to fail.
    assert!(wait_until(WAIT, || master.publishers_of("/mixed").len() == 1));
    std::thread::sleep(Duration::from_millis(500));
    counter.publish(Counter { value: 7 }).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(sub.num_publishers(), 0);
    assert_eq!(counter.num_subscribers(), 0);
    assert!(seen.lock().is_empty());

    // Same node, same topic, conflicting schema.
    let err = listener
        .subscribe::<Counter, _>("/mixed", 10, |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::Md5Mismatch { .. }), "{:?}", err);
}

#[test]
fn test_unadvertise_on_drop() {
    let master = FakeMaster::start();
    let node = Node::new("talker", master.config()).unwrap();
    let chatter = node.advertise::<StringMsg>("chatter", 10, false).unwrap();
    let clone = chatter.clone();
    drop(chatter);
    assert_eq!(master.publishers_of("/chatter").len(), 1);
    drop(clone);
    assert!(master.publishers_of("/chatter").is_empty());
    assert_eq!(master.calls_to("unregisterPublisher").len(), 1);
}

#[test]
fn test_slave_api_introspection() {
    let master = FakeMaster::start();
    let node = Node::new("introspect", master.config()).unwrap();
    let _chatter = node.advertise::<StringMsg>("chatter", 10, false).unwrap();
    let _sub = node.subscribe::<StringMsg, _>("other", 10, |_| {}).unwrap();

    let (host, port) = parse_http_uri(node.uri()).unwrap();
    let client = XmlRpcClient::new(host, port, Duration::from_secs(1), Duration::from_secs(2));

    let publications = client
        .call("getPublications", &[Value::from("/tester")])
        .unwrap();
    let payload = &publications.as_array().unwrap()[2];
    assert_eq!(
        *payload,
        Value::Array(vec![Value::Array(vec![
            Value::from("/chatter"),
            Value::from("std_msgs/String"),
        ])])
    );

    let pid = client.call("getPid", &[Value::from("/tester")]).unwrap();
    assert_eq!(
        pid.as_array().unwrap()[2].as_i32(),
        Some(std::process::id() as i32)
    );

    let stats = client.call("getBusStats", &[Value::from("/tester")]).unwrap();
    assert_eq!(stats.as_array().unwrap()[0].as_i32(), Some(1));

    let topic = client
        .call(
            "requestTopic",
            &[
                Value::from("/tester"),
                Value::from("/chatter"),
                Value::Array(vec![Value::Array(vec![Value::from("UDPROS")])]),
            ],
        )
        .unwrap();
    assert_eq!(topic.as_array().unwrap()[0].as_i32(), Some(0));
}

#[test]
fn test_remote_shutdown() {
    let master = FakeMaster::start();
    let node = Node::new("victim", master.config()).unwrap();
    let (host, port) = parse_http_uri(node.uri()).unwrap();
    let client = XmlRpcClient::new(host, port, Duration::from_secs(1), Duration::from_secs(2));
    let reply = client
        .call("shutdown", &[Value::from("/tester"), Value::from("test over")])
        .unwrap();
    assert_eq!(reply.as_array().unwrap()[0].as_i32(), Some(1));
    assert!(wait_until(WAIT, || node.is_shutdown()));
    assert!(matches!(
        node.advertise::<StringMsg>("late", 1, false),
        Err(Error::Shutdown)
    ));
}

#[test]
fn test_publisher_update_drops_unlisted_link() {
    let master = FakeMaster::start();
    let listener = Node::new("listener", master.config()).unwrap();
    let talker = Node::new("talker", master.config()).unwrap();
    let _own = listener.advertise::<StringMsg>("/chatter", 10, false).unwrap();
    let remote = talker.advertise::<StringMsg>("/chatter", 10, false).unwrap();

    let sub = listener.subscribe::<StringMsg, _>("/chatter", 10, |_| {}).unwrap();
    assert!(wait_until(WAIT, || sub.num_publishers() == 2));
    assert!(wait_until(WAIT, || remote.num_subscribers() == 1));

    // The master now lists only the listener itself.
    let (host, port) = parse_http_uri(listener.uri()).unwrap();
    let client = XmlRpcClient::new(host, port, Duration::from_secs(1), Duration::from_secs(2));
    let reply = client
        .call(
            "publisherUpdate",
            &[
                Value::from("/master"),
                Value::from("/chatter"),
                Value::Array(vec![Value::from(listener.uri())]),
            ],
        )
        .unwrap();
    assert_eq!(reply.as_array().unwrap()[0].as_i32(), Some(1));

    assert!(wait_until(WAIT, || sub.num_publishers() == 1));
    assert_eq!(sub.publisher_names(), vec!["/listener".to_string()]);
    assert!(wait_until(WAIT, || remote.num_subscribers() == 0));
}

#[test]
fn test_udpros_publisher_is_not_connected() {
    let master = FakeMaster::start();
    let requests = Arc::new(AtomicUsize::new(0));
    let handlers: HandlerTable = Arc::new(dashmap::DashMap::new());
    let seen = requests.clone();
    handlers.insert(
        "requestTopic".to_string(),
        Arc::new(move |_: &[Value]| {
            seen.fetch_add(1, Ordering::SeqCst);
            common::ok(Value::Array(vec![
                Value::from("UDPROS"),
                Value::from("127.0.0.1"),
                Value::Int(40000),
                Value::Int(1),
                Value::Int(1500),
            ]))
        }),
    );
    let udp_node = XmlRpcServer::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), handlers).unwrap();
    let udp_uri = format!("http://127.0.0.1:{}/", udp_node.port());
    master.add_publisher("/udp_talker", "/udp", "std_msgs/String", &udp_uri);

    let listener = Node::new("listener", master.config()).unwrap();
    let sub = listener.subscribe::<StringMsg, _>("/udp", 10, |_| {}).unwrap();
    assert!(wait_until(WAIT, || requests.load(Ordering::SeqCst) >= 1));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sub.num_publishers(), 0);
    udp_node.shutdown();
}

#[test]
fn test_failed_registration_fails_concurrent_subscriber() {
    let master = FakeMaster::start();
    master.override_method("registerSubscriber", |_| {
        thread::sleep(Duration::from_millis(300));
        common::err("registration refused")
    });
    let node = Node::new("listener", master.config()).unwrap();

    let first = {
        let node = node.clone();
        thread::spawn(move || node.subscribe::<StringMsg, _>("/flaky", 10, |_| {}).map(|_| ()))
    };
    thread::sleep(Duration::from_millis(100));
    let second = node.subscribe::<StringMsg, _>("/flaky", 10, |_| {});

    assert!(second.is_err());
    assert!(first.join().unwrap().is_err());
    // The waiting subscriber made its own attempt.
    assert_eq!(master.calls_to("registerSubscriber").len(), 2);
}

#[test]
fn test_concurrent_callbacks_run_in_parallel() {
    let master = FakeMaster::start();
    let talker = Node::new("talker", master.config()).unwrap();
    let listener = Node::new("listener", master.config()).unwrap();
    let mut spinner = listener.async_spinner(2);
    spinner.start().unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let (a, p, d) = (active.clone(), peak.clone(), done.clone());
    let sub = listener
        .subscribe_with_options::<StringMsg, _>(
            "/work",
            SubscriberOptions::new(10).with_concurrent_callbacks(true),
            move |_| {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
                a.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
    let work = talker.advertise::<StringMsg>("/work", 10, false).unwrap();
    assert!(wait_until(WAIT, || work.num_subscribers() == 1 && sub.num_publishers() == 1));

    for i in 0..4 {
        work.publish(StringMsg::new(format!("job {}", i))).unwrap();
        thread::sleep(Duration::from_millis(50));
    }
    assert!(wait_until(WAIT, || done.load(Ordering::SeqCst) == 4));
    assert!(peak.load(Ordering::SeqCst) > 1);
}
