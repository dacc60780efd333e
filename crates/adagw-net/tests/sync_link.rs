//! ---
//! gw_section: "04-networking-transport"
//! gw_subsection: "tests"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Synchronous link against an in-process TCP server."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
mod common;

use std::sync::Arc;
use std::time::Duration;

use adagw_common::shutdown;
use adagw_msg::{CommandState, XmlCodec};
use adagw_net::{read_frame, write_frame, FrameSplitter, LinkError, ServerLink, SynchronousLink};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use common::*;

fn link(addr: std::net::SocketAddr) -> Arc<SynchronousLink> {
    Arc::new(SynchronousLink::new(
        server_config(),
        connector(addr),
        Arc::new(XmlCodec::new()),
        identity(),
        clock(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deliver_returns_server_answer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_frame(&mut socket, &mut FrameSplitter::new(), Duration::from_secs(2)).await.unwrap();
        write_frame(
            &mut socket,
            r#"<server_adapter protocol_version="1.1" state="set" euid="5"><value module_id="1">3</value></server_adapter>"#,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        request
    });

    let command = link(addr).deliver(&reading()).await.unwrap();
    assert_eq!(command.state, CommandState::Set);
    assert_eq!(command.euid, 5);
    assert_eq!(command.values, vec![(1, 3.0)]);

    let request = server.await.unwrap();
    assert!(request.contains(r#"state="data""#));
    assert!(request.contains(r#"adapter_id="0x42""#));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deliver_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = link(addr).deliver(&reading()).await.unwrap_err();
    assert!(matches!(err, LinkError::Io(_) | LinkError::Timeout { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn receive_loop_routes_split_frames_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (trigger, shutdown) = shutdown::channel();
    let router = Arc::new(Recorder::default());
    let runner = tokio::spawn(link(addr).run(router.clone(), shutdown));

    let (mut socket, _) = listener.accept().await.unwrap();
    let register = read_frame(&mut socket, &mut FrameSplitter::new(), Duration::from_secs(2)).await.unwrap();
    assert!(register.contains(r#"state="register""#));
    write_frame(&mut socket, r#"<server_adapter state="ack"/>"#, Duration::from_secs(2))
        .await
        .unwrap();

    socket
        .write_all(b"<server_adapter state=\"set\" euid=\"1\"/>\0<server_adapter state=\"listen\"/>\0<server_adapter sta")
        .await
        .unwrap();
    socket.write_all(b"te=\"clean\" euid=\"2\"/>\0").await.unwrap();
    router.wait_for(3).await;
    let states: Vec<_> = router.commands().into_iter().map(|c| c.state).collect();
    assert_eq!(states, vec![CommandState::Set, CommandState::Listen, CommandState::Clean]);

    // Server hangs up; the link must come back with a fresh registration.
    drop(socket);
    let (mut socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("reconnected")
        .unwrap();
    let register = read_frame(&mut socket, &mut FrameSplitter::new(), Duration::from_secs(2)).await.unwrap();
    assert!(register.contains(r#"state="register""#));
    write_frame(&mut socket, r#"<server_adapter state="ack"/>"#, Duration::from_secs(2))
        .await
        .unwrap();

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("link stops on shutdown")
        .unwrap();
}
