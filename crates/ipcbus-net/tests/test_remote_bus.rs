use ipcbus_core::{listener, Event, EventBus, EventBusError, ListenerRef, RecordErrors};
use ipcbus_net::{EventBusClient, EventBusServer, RemoteEventBus};
use parking_lot::Mutex;
use serde_json::json;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn recorder() -> (Arc<Mutex<Vec<Event>>>, ListenerRef) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let e = events.clone();
    let l = listener(move |event| {
        e.lock().push(event.clone());
        Ok(())
    });
    (events, l)
}

fn counter(user_only: bool) -> (Arc<AtomicUsize>, ListenerRef) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let l = listener(move |event| {
        if !user_only || event.is_user_event() {
            c.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });
    (count, l)
}

fn pair() -> (EventBusServer, EventBusClient) {
    let server = EventBusServer::builder()
        .id("peer1")
        .bind("127.0.0.1")
        .listen_random()
        .build()
        .unwrap();
    let client = EventBusClient::builder()
        .id("peer2")
        .connect("127.0.0.1", server.server_port())
        .build()
        .unwrap();
    assert!(wait_until(|| server.client_count() == 1));
    (server, client)
}

#[test]
fn test_round_trip_both_directions() {
    let (server, client) = pair();
    let (on_server, l) = recorder();
    server.on("action", l).unwrap();
    let (on_client, l) = recorder();
    client.on("reply", l).unwrap();

    client.trigger("action", Some(json!("data"))).unwrap();
    assert!(wait_until(|| on_server.lock().len() == 1));
    {
        let events = on_server.lock();
        assert_eq!(events[0].source(), "peer2");
        assert_eq!(events[0].name(), "action");
        assert_eq!(events[0].data(), Some(&json!("data")));
    }

    server.trigger("reply", Some(json!({ "n": 42 }))).unwrap();
    assert!(wait_until(|| on_client.lock().len() == 1));
    let events = on_client.lock();
    assert_eq!(events[0].source(), "peer1");
    assert_eq!(events[0].data_as::<serde_json::Value>().unwrap()["n"], 42);
}

#[test]
fn test_client_server_fan_out() {
    let (server, client) = pair();
    let (count, l) = counter(true);
    server.on_all(l.clone());
    client.on_all(l);

    server.trigger("action", None).unwrap();
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 2));

    client.trigger("action", None).unwrap();
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 4));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), 4);
}

#[test]
fn test_server_relays_to_every_client() {
    let server = EventBusServer::builder()
        .bind("127.0.0.1")
        .listen_random()
        .build()
        .unwrap();
    let (count, l) = counter(true);
    let clients: Vec<EventBusClient> = (0..3)
        .map(|_| {
            EventBusClient::builder()
                .connect("127.0.0.1", server.server_port())
                .on_all(l.clone())
                .build()
                .unwrap()
        })
        .collect();
    assert!(wait_until(|| server.client_count() == 3));

    server.trigger("broadcast", Some(json!(1))).unwrap();
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 3));
    drop(clients);
    assert!(wait_until(|| server.client_count() == 0));
}

#[test]
fn test_connect_event_carries_client_id() {
    let (connects, l) = recorder();
    let server = EventBusServer::builder()
        .bind("127.0.0.1")
        .listen_random()
        .on("eventbus.client.connect", l)
        .build()
        .unwrap();
    let client = EventBusClient::builder()
        .connect("127.0.0.1", server.server_port())
        .build()
        .unwrap();

    assert!(wait_until(|| connects.lock().len() == 1));
    assert_eq!(connects.lock()[0].data_as::<String>().unwrap(), client.id());
    assert_eq!(client.server_host(), "127.0.0.1");
}

#[test]
fn test_concurrent_client_close_emits_one_disconnect() {
    let (server, client) = pair();
    let (disconnects, l) = counter(false);
    client.on("eventbus.client.disconnect", l).unwrap();
    let (relayed, l) = counter(false);
    server.on("eventbus.client.disconnect", l).unwrap();

    let client = Arc::new(client);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || client.close())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(client.is_closed());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(wait_until(|| server.client_count() == 0));
    assert!(wait_until(|| relayed.load(Ordering::SeqCst) == 1));

    // Sending on a closed client is a silent no-op.
    assert!(client.trigger("action", None).is_ok());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_server_close_disconnects_clients() {
    let (server, client) = pair();
    let (closes, l) = counter(false);
    server.on("eventbus.server.close", l).unwrap();
    let (disconnects, l) = counter(false);
    client.on("eventbus.client.disconnect", l).unwrap();

    let server = Arc::new(server);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let server = server.clone();
            thread::spawn(move || server.close())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(server.is_closed());
    assert_eq!(server.client_count(), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(wait_until(|| client.is_closed()));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_malformed_stream_reports_client_error() {
    let server = EventBusServer::builder()
        .id("peer1")
        .bind("127.0.0.1")
        .listen_random()
        .build()
        .unwrap();
    let (errors, l) = recorder();
    server.on("eventbus.client.error", l).unwrap();
    let (disconnects, l) = counter(false);
    server.on("eventbus.client.disconnect", l).unwrap();

    let mut raw = TcpStream::connect(("127.0.0.1", server.server_port())).unwrap();
    assert!(wait_until(|| server.client_count() == 1));
    raw.write_all(b"this is not an event").unwrap();
    raw.flush().unwrap();

    assert!(wait_until(|| errors.lock().len() == 1));
    assert!(wait_until(|| server.client_count() == 0));
    assert!(wait_until(|| disconnects.load(Ordering::SeqCst) == 1));

    let error = errors.lock()[0].clone();
    assert_eq!(error.source(), raw.local_addr().unwrap().to_string());
    assert!(error.data_as::<String>().is_some());
    assert_eq!(errors.lock().len(), 1);
}

#[test]
fn test_connect_failure() {
    let port = {
        let free = TcpListener::bind("127.0.0.1:0").unwrap();
        free.local_addr().unwrap().port()
    };
    let result = EventBusClient::builder().connect("127.0.0.1", port).build();
    assert!(matches!(result, Err(EventBusError::Connect { .. })));
}

#[test]
fn test_bind_failure() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let result = EventBusServer::builder()
        .bind("127.0.0.1")
        .listen(port)
        .build();
    assert!(matches!(result, Err(EventBusError::Bind { .. })));
}

#[test]
fn test_reserved_names_rejected_remotely() {
    let (server, client) = pair();
    assert!(matches!(
        client.trigger("eventbus.client.connect", None),
        Err(EventBusError::ReservedEventName { .. })
    ));
    assert!(matches!(
        server.trigger("", None),
        Err(EventBusError::InvalidEventName)
    ));
}

#[test]
fn test_remote_listener_failure_goes_to_policy() {
    let errors = Arc::new(RecordErrors::new());
    let server = EventBusServer::builder()
        .bind("127.0.0.1")
        .listen_random()
        .on_error(errors.clone())
        .on("action", listener(|_| Err("rejected".into())))
        .build()
        .unwrap();
    let client = EventBusClient::builder()
        .connect("127.0.0.1", server.server_port())
        .build()
        .unwrap();

    client.trigger("action", None).unwrap();
    assert!(wait_until(|| errors.len() == 1));
    assert_eq!(errors.errors()[0].message, "rejected");
    assert!(!client.is_closed());
}

#[test]
fn test_display() {
    let (server, client) = pair();
    assert_eq!(server.to_string(), "EventBusServer:peer1");
    assert_eq!(client.to_string(), "EventBusClient:peer2");
}
