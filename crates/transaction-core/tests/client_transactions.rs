//! Client transaction behaviour: retransmission timers, ACK generation,
//! CANCEL, transport fallback and forked responses

mod test_utils;

use std::time::Duration;

use siptx_sip_core::{Method, Via};
use siptx_sip_transport::{SendError, TransportKind};
use siptx_transaction_core::{AgentConfig, AgentEvent, ClientState, Error, RequestSpec};
use test_utils::*;

fn send(env: &mut TestEnv, method: Method, call_id: &str) -> siptx_transaction_core::OutgoingId {
    let request = local_request(method, "sip:bob@192.0.2.2", call_id, 1);
    env.agent
        .request(RequestSpec::new(request).to(peer()))
        .expect("request accepted")
}

/// Timer E doubles from T1, a 200 completes the transaction and Timer K
/// frees it
#[test]
fn test_non_invite_retransmission_and_completion() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Options, "cli-1");
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Trying);

    // 0.5 + 1 + 2 seconds
    env.run_for(Duration::from_secs(4));
    assert_eq!(env.transport.requests(&Method::Options).len(), 4);

    let sent = env.last_request(&Method::Options);
    env.deliver(answer(&sent, 200, Some("far")));
    let events = env.events();
    assert_eq!(TestEnv::responses_for(&events, id), vec![(200, false)]);
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Completed);

    // A retransmitted 200 is absorbed
    env.deliver(answer(&sent, 200, Some("far")));
    assert!(env.events().is_empty());

    env.run_for(env.agent.config().t4);
    assert!(env.agent.outgoing_state(id).is_err());
    assert_eq!(env.agent.stats().outgoing_table, 0);
}

/// After a provisional response a non-INVITE request is retransmitted
/// every T2
#[test]
fn test_non_invite_provisional_switches_to_t2() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Options, "cli-2");
    let sent = env.last_request(&Method::Options);
    env.deliver(answer(&sent, 100, None));
    assert!(env.events().is_empty(), "100 is not passed up");
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Proceeding);

    env.run_for(Duration::from_secs(4));
    assert_eq!(env.transport.requests(&Method::Options).len(), 2);
    env.run_for(Duration::from_secs(4));
    assert_eq!(env.transport.requests(&Method::Options).len(), 3);
}

/// A non-2xx final to an INVITE is ACKed on the same branch, and so is
/// every retransmission of it
#[test]
fn test_invite_failure_is_acked() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Invite, "cli-3");
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Calling);
    let invite = env.last_request(&Method::Invite);

    env.deliver(answer(&invite, 180, Some("callee")));
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Proceeding);

    // Timer A stopped with the provisional
    env.run_for(Duration::from_secs(2));
    assert_eq!(env.transport.requests(&Method::Invite).len(), 1);

    env.deliver(answer(&invite, 486, Some("callee")));
    let ack = env.last_request(&Method::Ack);
    assert_eq!(ack.branch(), invite.branch());
    assert_eq!(ack.headers.to_tag(), Some("callee"));
    assert_eq!(ack.cseq().unwrap().seq, 1);
    assert_eq!(ack.uri, invite.uri);

    let events = env.events();
    assert_eq!(
        TestEnv::responses_for(&events, id),
        vec![(180, false), (486, false)]
    );

    env.deliver(answer(&invite, 486, Some("callee")));
    assert_eq!(env.transport.requests(&Method::Ack).len(), 2);
    assert!(env.events().is_empty());

    // Timer D
    env.run_for(env.agent.config().t1x64);
    assert!(env.agent.outgoing_state(id).is_err());
}

/// Timer B: retransmissions double without limit and the application gets
/// a local 408
#[test]
fn test_invite_timeout_gives_local_408() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Invite, "cli-4");

    env.run_for(env.agent.config().t1x64);
    // 0.5, 1.5, 3.5, 7.5, 15.5 and 31.5 seconds
    assert_eq!(env.transport.requests(&Method::Invite).len(), 7);

    let events = env.events();
    assert_eq!(TestEnv::responses_for(&events, id), vec![(408, true)]);
    assert!(env.agent.outgoing_state(id).is_err());
    assert_eq!(env.agent.stats().tout_request, 1);
}

/// A 408 to a non-INVITE request is swallowed; Timer F reports the timeout
#[test]
fn test_non_invite_408_is_reported_by_timer_f() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Message, "cli-5");
    let sent = env.last_request(&Method::Message);
    env.deliver(answer(&sent, 408, Some("far")));
    assert!(env.events().is_empty());

    env.run_for(env.agent.config().t1x64);
    let events = env.events();
    assert_eq!(TestEnv::responses_for(&events, id), vec![(408, true)]);
}

#[test]
fn test_pass_408_delivers_remote_timeout() {
    let mut env = TestEnv::new(AgentConfig {
        pass_408: true,
        ..AgentConfig::default()
    });
    let id = send(&mut env, Method::Message, "cli-6");
    let sent = env.last_request(&Method::Message);
    env.deliver(answer(&sent, 408, Some("far")));
    assert_eq!(TestEnv::responses_for(&env.events(), id), vec![(408, false)]);
}

/// CANCEL waits for a provisional response, shares the INVITE branch and
/// gets its own response
#[test]
fn test_cancel_is_delayed_until_provisional() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Invite, "cli-7");
    let invite = env.last_request(&Method::Invite);

    let cancel_id = env.agent.cancel(id).unwrap();
    assert!(env.transport.requests(&Method::Cancel).is_empty());
    assert_eq!(env.agent.outgoing_state(cancel_id).unwrap(), ClientState::Calling);
    assert!(matches!(env.agent.cancel(id), Err(Error::InvalidCancel(_))));

    env.deliver(answer(&invite, 180, Some("callee")));
    let cancel = env.last_request(&Method::Cancel);
    assert_eq!(cancel.branch(), invite.branch());
    assert_eq!(cancel.cseq().unwrap().method, Method::Cancel);
    assert_eq!(cancel.headers.to_tag(), None);

    env.deliver(answer(&cancel, 200, Some("callee")));
    env.deliver(answer(&invite, 487, Some("callee")));
    let events = env.events();
    assert_eq!(TestEnv::responses_for(&events, cancel_id), vec![(200, false)]);
    assert_eq!(
        TestEnv::responses_for(&events, id),
        vec![(180, false), (487, false)]
    );
    assert_eq!(env.transport.requests(&Method::Ack).len(), 1);
}

/// An INVITE answered before its delayed CANCEL went out drops the CANCEL
#[test]
fn test_delayed_cancel_dropped_by_final() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Invite, "cli-8");
    let invite = env.last_request(&Method::Invite);
    let cancel_id = env.agent.cancel(id).unwrap();

    env.deliver(answer(&invite, 603, Some("callee")));
    assert!(env.transport.requests(&Method::Cancel).is_empty());
    let events = env.events();
    assert_eq!(TestEnv::responses_for(&events, cancel_id), vec![(481, true)]);
}

#[test]
fn test_cancel_2543_completes_locally() {
    let mut env = TestEnv::new(AgentConfig::default().with_cancel_2543(true));
    let id = send(&mut env, Method::Invite, "cli-9");
    env.agent.cancel(id).unwrap();

    assert_eq!(env.transport.requests(&Method::Cancel).len(), 1);
    let events = env.events();
    assert_eq!(TestEnv::responses_for(&events, id), vec![(487, true)]);
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Completed);
}

#[test]
fn test_only_invite_can_be_canceled() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Options, "cli-10");
    assert!(matches!(env.agent.cancel(id), Err(Error::InvalidCancel(_))));

    let request = local_request(Method::Cancel, "sip:bob@192.0.2.2", "cli-10", 1);
    let err = env.agent.request(RequestSpec::new(request).to(peer())).unwrap_err();
    assert!(matches!(err, Error::InvalidCancel(_)));
}

/// Timer C cancels a stalled INVITE, then gives up with 408
#[test]
fn test_timer_c_cancels_then_times_out() {
    let mut env = TestEnv::new(AgentConfig::default().with_timer_c(Some(Duration::from_secs(10))));
    let id = send(&mut env, Method::Invite, "cli-11");
    let invite = env.last_request(&Method::Invite);
    env.deliver(answer(&invite, 180, Some("callee")));

    env.run_for(Duration::from_secs(10));
    assert_eq!(env.transport.requests(&Method::Cancel).len(), 1);

    env.run_for(Duration::from_secs(10));
    let events = env.events();
    assert_eq!(
        TestEnv::responses_for(&events, id),
        vec![(180, false), (408, true)]
    );
}

/// EMSGSIZE on UDP moves the request to TCP, which needs no retransmission
#[test]
fn test_message_too_large_falls_back_to_tcp() {
    let mut env = TestEnv::proxy();
    env.transport.fail_next(SendError::MessageTooLarge);
    let id = send(&mut env, Method::Options, "cli-12");

    let sent = env.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination.kind, TransportKind::Tcp);
    let via = sent[0].request().unwrap().top_via().unwrap();
    assert_eq!(via.transport, "TCP");
    assert_eq!(via.rport(), None);
    assert_eq!(
        env.agent.outgoing_destination(id).unwrap().map(|d| d.kind),
        Some(TransportKind::Tcp)
    );

    env.run_for(Duration::from_secs(2));
    assert_eq!(env.transport.sent().len(), 1);
}

/// Requests larger than the UDP MTU go over TCP without trying UDP
#[test]
fn test_oversized_request_uses_tcp() {
    let mut env = TestEnv::new(AgentConfig::default().with_udp_mtu(200));
    send(&mut env, Method::Options, "cli-13");
    let sent = env.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination.kind, TransportKind::Tcp);
}

/// A transient error is retried exactly once
#[test]
fn test_transient_error_retried_once() {
    let mut env = TestEnv::proxy();
    env.transport.fail_next(SendError::ConnectionClosed);
    let id = send(&mut env, Method::Options, "cli-14");
    assert_eq!(env.transport.sent().len(), 1);
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Trying);
}

/// With nowhere else to go a send failure becomes a local 503
#[test]
fn test_fatal_send_error_gives_local_503() {
    let mut env = TestEnv::proxy();
    env.transport
        .fail_kind(TransportKind::Udp, SendError::Fatal("unreachable".into()));
    let id = send(&mut env, Method::Options, "cli-15");

    let events = env.events();
    let AgentEvent::Response { response, local, .. } = &events[0] else {
        panic!("expected a response event, got {:?}", events);
    };
    assert!(*local);
    assert_eq!(response.status, 503);
    assert_eq!(response.reason, "Transport Error");
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Terminated);
}

/// The Via is rewritten for the chosen transport, with rport on UDP
#[test]
fn test_via_and_optional_headers() {
    let mut env = TestEnv::new(AgentConfig::default().with_timestamp(true));
    send(&mut env, Method::Options, "cli-16");

    let sent = env.last_request(&Method::Options);
    let via = sent.top_via().unwrap();
    assert_eq!(via.transport, "UDP");
    assert_eq!(via.host, "192.0.2.1");
    assert_eq!(via.port, Some(5060));
    assert!(via.has_rfc3261_branch());
    assert_eq!(via.rport(), Some(None));
    assert!(sent.headers.timestamp.is_some());
    assert_eq!(sent.headers.max_forwards, Some(70));
}

#[test]
fn test_rel100_advertised_on_invite() {
    let mut env = TestEnv::new(AgentConfig::default().with_rel100(true));
    send(&mut env, Method::Invite, "cli-17");
    let invite = env.last_request(&Method::Invite);
    assert!(invite.headers.supports("100rel"));
}

/// Each request gets a fresh branch
#[test]
fn test_branches_are_unique() {
    let mut env = TestEnv::proxy();
    send(&mut env, Method::Options, "cli-18");
    send(&mut env, Method::Options, "cli-18");
    let sent = env.transport.requests(&Method::Options);
    assert_ne!(sent[0].request().unwrap().branch(), sent[1].request().unwrap().branch());
}

/// A responses for an unknown transaction is dropped by a proxy
#[test]
fn test_stray_response_dropped() {
    let mut env = TestEnv::proxy();
    let mut request = local_request(Method::Options, "sip:bob@192.0.2.2", "cli-19", 1);
    request
        .headers
        .via
        .push(Via::new("UDP", "192.0.2.1", Some(5060)).with_branch(&new_branch()));
    env.deliver(answer(&request, 200, Some("x")));
    assert!(env.events().is_empty());
    assert!(env.transport.sent().is_empty());
    assert_eq!(env.agent.stats().trless_response, 1);
}

/// A user agent answers a 2xx nobody asked for with ACK and BYE
#[test]
fn test_orphan_2xx_is_acked_and_released() {
    let mut env = TestEnv::user_agent();
    let mut invite = local_request(Method::Invite, "sip:bob@192.0.2.2", "cli-20", 1);
    invite
        .headers
        .via
        .push(Via::new("UDP", "192.0.2.1", Some(5060)).with_branch(&new_branch()));
    let mut ok = answer(&invite, 200, Some("remote"));
    ok.headers.contact.push(name_addr("<sip:bob@192.0.2.2:5062>"));
    env.deliver(ok);

    let ack = env.last_request(&Method::Ack);
    let bye = env.last_request(&Method::Bye);
    assert_eq!(ack.headers.to_tag(), Some("remote"));
    assert_eq!(ack.uri.port, Some(5062));
    assert_eq!(bye.cseq().unwrap().seq, 2);
    assert_eq!(bye.headers.to_tag(), Some("remote"));
    assert!(env.events().is_empty(), "orphan handling is internal");
}

/// A second 2xx from another fork is accepted by a proxy and released by a
/// user agent
#[test]
fn test_forked_2xx_handling() {
    let mut proxy = TestEnv::proxy();
    let id = send(&mut proxy, Method::Invite, "cli-21");
    let invite = proxy.last_request(&Method::Invite);
    proxy.deliver(answer(&invite, 200, Some("a")));
    proxy.deliver(answer(&invite, 200, Some("a")));
    proxy.deliver(answer(&invite, 200, Some("b")));
    proxy.deliver(answer(&invite, 200, Some("b")));
    assert_eq!(
        TestEnv::responses_for(&proxy.events(), id),
        vec![(200, false), (200, false)]
    );

    let mut ua = TestEnv::user_agent();
    let id = send(&mut ua, Method::Invite, "cli-22");
    let invite = ua.last_request(&Method::Invite);
    ua.deliver(answer(&invite, 200, Some("a")));
    ua.deliver(answer(&invite, 200, Some("a")));
    ua.deliver(answer(&invite, 200, Some("b")));
    assert_eq!(
        TestEnv::responses_for(&ua.events(), id),
        vec![(200, false)]
    );
    assert_eq!(ua.last_request(&Method::Bye).headers.to_tag(), Some("b"));
}

/// Retransmissions of the same 2xx reach the application once
#[test]
fn test_repeated_2xx_delivered_once() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Invite, "cli-25");
    let invite = env.last_request(&Method::Invite);
    let ok = answer(&invite, 200, Some("far"));
    for _ in 0..3 {
        env.deliver(ok.clone());
    }
    assert_eq!(
        TestEnv::responses_for(&env.events(), id),
        vec![(200, false)]
    );
    assert_eq!(env.agent.outgoing_status(id).unwrap(), 200);
}

/// Responses carrying a tracked To tag go to the tagged fork
#[test]
fn test_tagged_fork_receives_its_responses() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Invite, "cli-23");
    let invite = env.last_request(&Method::Invite);

    env.deliver(answer(&invite, 180, Some("a")));
    let fork = env.agent.tagged(id, "a").unwrap();
    assert_ne!(fork, id);
    assert_eq!(env.agent.tagged(id, "a").unwrap(), fork);
    assert!(env.agent.tagged(fork, "b").is_err());

    env.deliver(answer(&invite, 183, Some("b")));
    env.deliver(answer(&invite, 200, Some("a")));
    let events = env.events();
    assert_eq!(
        TestEnv::responses_for(&events, id),
        vec![(180, false), (183, false)]
    );
    assert_eq!(TestEnv::responses_for(&events, fork), vec![(200, false)]);
    assert_eq!(env.agent.outgoing_state(fork).unwrap(), ClientState::Completed);
}

/// Destroying a pending INVITE cancels it and silences its events
#[test]
fn test_destroy_pending_invite_cancels() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Invite, "cli-24");
    let invite = env.last_request(&Method::Invite);
    env.deliver(answer(&invite, 180, Some("callee")));
    env.events();

    env.agent.destroy_outgoing(id).unwrap();
    assert_eq!(env.transport.requests(&Method::Cancel).len(), 1);
    env.deliver(answer(&invite, 487, Some("callee")));
    assert!(TestEnv::responses_for(&env.events(), id).is_empty());
}

#[test]
fn test_shutdown_answers_pending_requests() {
    let mut env = TestEnv::proxy();
    let id = send(&mut env, Method::Options, "cli-25");
    env.agent.shutdown();

    let events = env.events();
    assert_eq!(TestEnv::responses_for(&events, id), vec![(503, true)]);
    assert!(env.agent.is_shut_down());
    assert_eq!(env.agent.stats().outgoing_table, 0);
    let request = local_request(Method::Options, "sip:bob@192.0.2.2", "cli-26", 1);
    assert!(env.agent.request(RequestSpec::new(request).to(peer())).is_err());
}
