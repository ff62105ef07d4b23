//! Server transaction behaviour: retransmission absorption, the INVITE
//! completion timers, CANCEL handling and the stateless rejections

mod test_utils;

use std::time::Duration;

use siptx_sip_core::Method;
use siptx_sip_transport::SendError;
use siptx_transaction_core::{AgentConfig, AgentEvent, Error, ServerState};
use test_utils::*;

/// A retransmitted non-INVITE request gets the stored final response and
/// the transaction is freed once Timer J expires
#[test]
fn test_non_invite_final_is_resent_until_timer_j() {
    let mut env = TestEnv::proxy();
    let options = peer_request(Method::Options, "srv-1", 1, &new_branch());
    let id = env.receive_new(options.clone());
    assert_eq!(env.agent.incoming_state(id).unwrap(), ServerState::Trying);

    env.agent.reply(id, 200, None).unwrap();
    assert_eq!(env.agent.incoming_state(id).unwrap(), ServerState::Completed);

    env.deliver(options);
    assert_eq!(env.sent_statuses(), vec![200, 200]);
    assert!(env.events().is_empty(), "retransmission must not surface");
    assert_eq!(env.agent.stats().recv_retry, 1);

    env.run_for(env.agent.config().t1x64);
    assert!(env.agent.incoming_state(id).is_err());
    assert_eq!(env.agent.stats().incoming_table, 0);
}

/// INVITE retransmission before any response is answered with 100, a
/// failure is retransmitted by Timer G and the ACK confirms the transaction
#[test]
fn test_invite_failure_retransmitted_until_ack() {
    let mut env = TestEnv::proxy();
    let invite = peer_request(Method::Invite, "srv-2", 1, &new_branch());
    let id = env.receive_new(invite.clone());

    env.deliver(invite.clone());
    assert_eq!(env.sent_statuses(), vec![100]);
    assert_eq!(env.agent.incoming_state(id).unwrap(), ServerState::Proceeding);

    env.agent.reply(id, 486, None).unwrap();
    let busy = env.transport.last_response().unwrap();
    assert!(busy.headers.to_tag().is_some());

    env.run_for(Duration::from_millis(500));
    assert_eq!(env.sent_statuses(), vec![100, 486, 486]);

    let ack = peer_follow_up(&invite, Method::Ack, busy.headers.to_tag());
    env.deliver(ack);
    assert_eq!(env.agent.incoming_state(id).unwrap(), ServerState::Confirmed);
    assert!(env.events().is_empty(), "ACK for a failure is absorbed");
    assert_eq!(env.agent.stats().acked_tr, 1);

    // Retransmissions stop once confirmed
    env.run_for(Duration::from_secs(2));
    assert_eq!(env.sent_statuses().len(), 3);

    // Timer I
    env.run_for(env.agent.config().t4);
    assert!(env.agent.incoming_state(id).is_err());
}

/// Timer H: a final response that is never acknowledged fails the
/// transaction with 408
#[test]
fn test_missing_ack_reports_failure() {
    let mut env = TestEnv::proxy();
    let invite = peer_request(Method::Invite, "srv-3", 1, &new_branch());
    let id = env.receive_new(invite);

    env.agent.reply(id, 603, None).unwrap();
    env.run_for(env.agent.config().t1x64);

    let events = env.events();
    assert!(events.contains(&AgentEvent::IncomingFailed { id, status: 408 }));
    assert!(env.sent_statuses().len() > 5);
    assert!(env.agent.incoming_state(id).is_err());
    assert_eq!(env.agent.stats().tout_response, 1);
}

/// Timer G doubles up to T2
#[test]
fn test_timer_g_backs_off_to_t2() {
    let mut env = TestEnv::proxy();
    let invite = peer_request(Method::Invite, "srv-4", 1, &new_branch());
    let id = env.receive_new(invite);
    env.agent.reply(id, 480, None).unwrap();

    // 0.5 + 1 + 2 + 4 + 4 seconds
    env.run_for(Duration::from_millis(11_500));
    assert_eq!(env.sent_statuses().len(), 1 + 5);
}

/// CANCEL is answered with 200, the INVITE with 487 and the application
/// learns about it
#[test]
fn test_cancel_terminates_pending_invite() {
    let mut env = TestEnv::proxy();
    let invite = peer_request(Method::Invite, "srv-5", 1, &new_branch());
    let id = env.receive_new(invite.clone());

    env.deliver(peer_follow_up(&invite, Method::Cancel, None));

    let sent = env.transport.responses();
    let statuses: Vec<(u16, Method)> = sent
        .iter()
        .filter_map(|s| s.response())
        .map(|r| (r.status, r.cseq().unwrap().method.clone()))
        .collect();
    assert_eq!(
        statuses,
        vec![(200, Method::Cancel), (487, Method::Invite)]
    );

    let events = env.events();
    assert!(matches!(
        events.as_slice(),
        [AgentEvent::Canceled { id: canceled, .. }] if *canceled == id
    ));
    assert_eq!(env.agent.incoming_status(id).unwrap(), 487);
    assert_eq!(env.agent.stats().canceled_tr, 1);

    // A second CANCEL is a retransmission of the first
    env.deliver(peer_follow_up(&invite, Method::Cancel, None));
    assert_eq!(env.sent_statuses(), vec![200, 487, 200]);
    assert!(env.events().is_empty());
}

#[test]
fn test_cancel_without_transaction_gets_481() {
    let mut env = TestEnv::proxy();
    let invite = peer_request(Method::Invite, "srv-6", 1, &new_branch());
    env.deliver(peer_follow_up(&invite, Method::Cancel, None));

    assert_eq!(env.sent_statuses(), vec![481]);
    assert!(env.events().is_empty());
}

/// An automatic answer that fails to send is tried again from the
/// final-failed queue
#[test]
fn test_failed_automatic_answer_is_retried() {
    let mut env = TestEnv::proxy();
    env.transport.fail_next(SendError::Fatal("unreachable".into()));
    let invite = peer_request(Method::Invite, "srv-6b", 1, &new_branch());
    env.deliver(peer_follow_up(&invite, Method::Cancel, None));
    assert!(env.sent_statuses().is_empty());

    env.run_for(env.agent.config().t1 * 2);
    assert_eq!(env.sent_statuses(), vec![481]);
    assert!(env.events().is_empty());
}

/// CANCEL after the final response leaves the INVITE alone
#[test]
fn test_cancel_after_final_is_acknowledged_only() {
    let mut env = TestEnv::proxy();
    let invite = peer_request(Method::Invite, "srv-7", 1, &new_branch());
    let id = env.receive_new(invite.clone());
    env.agent.reply(id, 486, None).unwrap();

    env.deliver(peer_follow_up(&invite, Method::Cancel, None));
    assert_eq!(env.sent_statuses(), vec![486, 200]);
    assert!(env.events().is_empty());
}

#[test]
fn test_request_without_to_is_rejected() {
    let mut env = TestEnv::proxy();
    let mut options = peer_request(Method::Options, "srv-8", 1, &new_branch());
    options.headers.to = None;
    env.deliver(options);

    assert_eq!(env.sent_statuses(), vec![400]);
    assert!(env.events().is_empty());
    let stats = env.agent.stats();
    assert_eq!(stats.bad_request, 1);
    assert_eq!(stats.incoming_table, 0);
}

#[test]
fn test_oversized_request_is_rejected() {
    let mut env = TestEnv::new(AgentConfig {
        max_size: 300,
        ..AgentConfig::default()
    });
    let mut options = peer_request(Method::Options, "srv-9", 1, &new_branch());
    options.body = vec![b'x'; 400].into();
    options.headers.content_type = Some("text/plain".into());
    env.deliver(options);

    assert_eq!(env.sent_statuses(), vec![513]);
}

/// The same request reaching a user agent over two paths is answered 482
#[test]
fn test_merged_request_in_user_agent_mode() {
    let mut env = TestEnv::user_agent();
    let first = peer_request(Method::Invite, "srv-10", 1, &new_branch());
    env.receive_new(first);

    let forked = peer_request(Method::Invite, "srv-10", 1, &new_branch());
    env.deliver(forked);

    assert_eq!(env.sent_statuses(), vec![482]);
    assert!(env.events().is_empty());
    assert_eq!(env.agent.stats().merged_request, 1);
}

/// A proxy keeps both copies; merging is a user agent concern
#[test]
fn test_proxy_does_not_merge() {
    let mut env = TestEnv::proxy();
    env.receive_new(peer_request(Method::Invite, "srv-11", 1, &new_branch()));
    env.receive_new(peer_request(Method::Invite, "srv-11", 1, &new_branch()));
    assert!(env.sent_statuses().is_empty());
    assert_eq!(env.agent.stats().server_tr, 2);
}

#[test]
fn test_unknown_dialog_in_user_agent_mode() {
    let mut env = TestEnv::user_agent();
    let mut bye = peer_request(Method::Bye, "srv-12", 2, &new_branch());
    if let Some(to) = bye.headers.to.as_mut() {
        to.set_tag("gone");
    }
    env.deliver(bye);

    assert_eq!(env.sent_statuses(), vec![481]);
    assert!(env.events().is_empty());
}

#[test]
fn test_second_final_response_is_refused() {
    let mut env = TestEnv::proxy();
    let id = env.receive_new(peer_request(Method::Options, "srv-13", 1, &new_branch()));
    env.agent.reply(id, 200, None).unwrap();

    let err = env.agent.reply(id, 404, None).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(env.sent_statuses(), vec![200]);
}

#[test]
fn test_invalid_status_becomes_500() {
    let mut env = TestEnv::proxy();
    let id = env.receive_new(peer_request(Method::Options, "srv-14", 1, &new_branch()));
    env.agent.reply(id, 42, None).unwrap();
    assert_eq!(env.sent_statuses(), vec![500]);
}

#[test]
fn test_pending_limit_rejects_new_requests() {
    let mut env = TestEnv::new(AgentConfig::default().with_max_proceeding(1));
    let first = env.receive_new(peer_request(Method::Options, "srv-15", 1, &new_branch()));
    env.deliver(peer_request(Method::Options, "srv-16", 1, &new_branch()));
    assert_eq!(env.sent_statuses(), vec![503]);

    // Answering the first frees a slot
    env.agent.reply(first, 200, None).unwrap();
    env.receive_new(peer_request(Method::Options, "srv-17", 1, &new_branch()));
}

/// In user agent mode the ACK for a 2xx is its own transaction, matched to
/// the INVITE by tags
#[test]
fn test_ack_for_2xx_reaches_application() {
    let mut env = TestEnv::user_agent();
    let invite = peer_request(Method::Invite, "srv-18", 1, &new_branch());
    let id = env.receive_new(invite.clone());

    env.agent.reply(id, 200, None).unwrap();
    let ok = env.transport.last_response().unwrap();
    let tag = ok.headers.to_tag().unwrap().to_string();
    assert_eq!(env.agent.incoming_state(id).unwrap(), ServerState::Completed);

    let mut ack = peer_request(Method::Ack, "srv-18", 1, &new_branch());
    if let Some(to) = ack.headers.to.as_mut() {
        to.set_tag(&tag);
    }
    env.deliver(ack);

    let events = env.events();
    assert!(matches!(
        events.as_slice(),
        [AgentEvent::Ack { id: acked, .. }] if *acked == id
    ));
    assert_eq!(env.agent.incoming_state(id).unwrap(), ServerState::Confirmed);
}

/// A stray ACK is passed up without a transaction
#[test]
fn test_stray_ack_is_transactionless() {
    let mut env = TestEnv::proxy();
    let mut ack = peer_request(Method::Ack, "srv-19", 1, &new_branch());
    if let Some(to) = ack.headers.to.as_mut() {
        to.set_tag("abc");
    }
    env.deliver(ack);
    assert!(matches!(
        env.events().as_slice(),
        [AgentEvent::TransactionlessRequest { .. }]
    ));
    assert!(env.sent_statuses().is_empty());
}

/// A proxy hands 2xx retransmission to the user agent, so its INVITE
/// transaction ends with the 2xx
#[test]
fn test_proxy_invite_terminates_on_2xx() {
    let mut env = TestEnv::proxy();
    let id = env.receive_new(peer_request(Method::Invite, "srv-20", 1, &new_branch()));
    env.agent.reply(id, 200, None).unwrap();
    assert_eq!(env.agent.incoming_state(id).unwrap(), ServerState::Terminated);

    env.agent.tick();
    assert!(env.agent.incoming_state(id).is_err());
}

/// An INVITE left alone gets an automatic 100 Trying
#[test]
fn test_automatic_trying_for_invite() {
    let mut env = TestEnv::proxy();
    let id = env.receive_new(peer_request(Method::Invite, "srv-21", 1, &new_branch()));
    env.run_for(env.agent.config().extra_100_delay());
    assert_eq!(env.sent_statuses(), vec![100]);
    assert_eq!(env.agent.incoming_state(id).unwrap(), ServerState::Proceeding);
}

/// Destroying an unanswered transaction answers it with 500
#[test]
fn test_destroy_unanswered_sends_500() {
    let mut env = TestEnv::proxy();
    let id = env.receive_new(peer_request(Method::Options, "srv-22", 1, &new_branch()));
    env.agent.destroy_incoming(id).unwrap();
    assert_eq!(env.sent_statuses(), vec![500]);
}

#[test]
fn test_stateless_mode_creates_no_transactions() {
    let mut env = TestEnv::new(AgentConfig::default().with_stateless(true));
    env.deliver(peer_request(Method::Invite, "srv-23", 1, &new_branch()));
    assert!(matches!(
        env.events().as_slice(),
        [AgentEvent::TransactionlessRequest { .. }]
    ));
    assert_eq!(env.agent.stats().incoming_table, 0);
}
