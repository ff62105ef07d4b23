//! Server location through the DNS cascade and failover between targets

mod test_utils;

use std::net::Ipv4Addr;

use siptx_sip_core::Method;
use siptx_sip_resolver::{DnsAnswer, DnsQuery, DnsRecord, LookupError, RecordType};
use siptx_sip_transport::{Destination, TransportKind};
use siptx_transaction_core::{AgentConfig, AgentEvent, ClientState, OutgoingId, RequestSpec};
use test_utils::*;

fn srv_env() -> TestEnv {
    TestEnv::new(
        AgentConfig::default()
            .with_naptr(false)
            .with_transports(vec![TransportKind::Udp]),
    )
}

fn options(env: &mut TestEnv, call_id: &str) -> OutgoingId {
    let request = local_request(Method::Options, "sip:bob@example.com", call_id, 1);
    env.agent.request(RequestSpec::new(request)).unwrap()
}

/// The single outstanding query, checked against what the cascade should ask
fn expect_query(env: &TestEnv, domain: &str, rtype: RecordType) -> DnsQuery {
    let mut queries = env.dns.take();
    assert_eq!(queries.len(), 1, "queries: {:?}", queries);
    let query = queries.remove(0);
    assert_eq!(query.domain, domain);
    assert_eq!(query.rtype, rtype);
    query
}

fn dest(addr: &str) -> Destination {
    Destination::udp(addr.parse().unwrap())
}

fn two_targets() -> Vec<DnsRecord> {
    vec![
        DnsRecord::srv(10, 1, 5060, "a.example.com"),
        DnsRecord::srv(20, 1, 5070, "b.example.com"),
    ]
}

/// SRV then A for the first target, and failover to the next SRV target
/// with a fresh branch when the first one never answers
#[test]
fn test_srv_failover_after_timeout() {
    let mut env = srv_env();
    let id = options(&mut env, "dns-1");
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Resolving);
    assert!(env.transport.sent().is_empty());

    let srv = expect_query(&env, "_sip._udp.example.com", RecordType::Srv);
    env.agent.dns_answer(DnsAnswer::records(&srv, two_targets()));
    let a = expect_query(&env, "a.example.com", RecordType::A);
    env.agent
        .dns_answer(DnsAnswer::records(&a, vec![DnsRecord::a(Ipv4Addr::new(192, 0, 2, 10))]));

    let first = env.transport.sent();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].destination, dest("192.0.2.10:5060"));
    let first_branch = first[0].request().unwrap().branch().unwrap().to_string();
    assert_eq!(env.agent.outgoing_state(id).unwrap(), ClientState::Trying);

    // Timer F with targets left moves on instead of failing
    env.run_for(env.agent.config().t1x64);
    let aaaa = expect_query(&env, "a.example.com", RecordType::Aaaa);
    env.agent.dns_answer(DnsAnswer::error(&aaaa, LookupError::NoData));
    let b = expect_query(&env, "b.example.com", RecordType::A);
    env.agent
        .dns_answer(DnsAnswer::records(&b, vec![DnsRecord::a(Ipv4Addr::new(192, 0, 2, 11))]));

    let last = env.transport.sent().last().cloned().unwrap();
    assert_eq!(last.destination, dest("192.0.2.11:5070"));
    assert_ne!(last.request().unwrap().branch().unwrap(), first_branch);
    assert!(TestEnv::responses_for(&env.events(), id).is_empty());

    // The failed target was graylisted; cached records lead straight to b
    env.transport.take_sent();
    options(&mut env, "dns-2");
    assert!(env.dns.take().is_empty());
    assert_eq!(env.transport.sent()[0].destination, dest("192.0.2.11:5070"));
}

/// SRV lookup and the A record of the first target
fn resolve_to_first(env: &mut TestEnv) {
    let srv = expect_query(env, "_sip._udp.example.com", RecordType::Srv);
    env.agent.dns_answer(DnsAnswer::records(&srv, two_targets()));
    let a = expect_query(env, "a.example.com", RecordType::A);
    env.agent
        .dns_answer(DnsAnswer::records(&a, vec![DnsRecord::a(Ipv4Addr::new(192, 0, 2, 10))]));
}

/// With graylisting off a timed out target keeps its SRV priority
#[test]
fn test_zero_graylist_keeps_priority() {
    let mut env = TestEnv::new(
        AgentConfig::default()
            .with_naptr(false)
            .with_transports(vec![TransportKind::Udp])
            .with_graylist(0),
    );
    options(&mut env, "dns-10");
    resolve_to_first(&mut env);

    env.run_for(env.agent.config().t1x64);
    let aaaa = expect_query(&env, "a.example.com", RecordType::Aaaa);
    env.agent.dns_answer(DnsAnswer::error(&aaaa, LookupError::NoData));
    let b = expect_query(&env, "b.example.com", RecordType::A);
    env.agent
        .dns_answer(DnsAnswer::records(&b, vec![DnsRecord::a(Ipv4Addr::new(192, 0, 2, 11))]));
    assert_eq!(
        env.transport.sent().last().unwrap().destination,
        dest("192.0.2.11:5070")
    );

    env.transport.take_sent();
    options(&mut env, "dns-11");
    assert!(env.dns.take().is_empty());
    assert_eq!(env.transport.sent()[0].destination, dest("192.0.2.10:5060"));
}

/// A target that answered with a provisional is not graylisted when the
/// transaction times out
#[test]
fn test_provisional_keeps_target_preferred() {
    let mut env = srv_env();
    let id = options(&mut env, "dns-12");
    resolve_to_first(&mut env);

    let sent = env.last_request(&Method::Options);
    env.deliver(answer(&sent, 100, None));
    env.run_for(env.agent.config().t1x64);
    assert_eq!(TestEnv::responses_for(&env.events(), id), vec![(408, true)]);
    assert!(env.dns.take().is_empty(), "no failover after a provisional");

    env.transport.take_sent();
    options(&mut env, "dns-13");
    assert!(env.dns.take().is_empty());
    assert_eq!(env.transport.sent()[0].destination, dest("192.0.2.10:5060"));
}

/// A 503 from one SRV target is not reported while others remain
#[test]
fn test_503_tries_next_target() {
    let mut env = srv_env();
    let id = options(&mut env, "dns-3");
    let srv = expect_query(&env, "_sip._udp.example.com", RecordType::Srv);
    env.agent.dns_answer(DnsAnswer::records(&srv, two_targets()));
    let a = expect_query(&env, "a.example.com", RecordType::A);
    env.agent
        .dns_answer(DnsAnswer::records(&a, vec![DnsRecord::a(Ipv4Addr::new(192, 0, 2, 10))]));

    let sent = env.last_request(&Method::Options);
    env.deliver(answer(&sent, 503, Some("busy")));
    let aaaa = expect_query(&env, "a.example.com", RecordType::Aaaa);
    env.agent.dns_answer(DnsAnswer::error(&aaaa, LookupError::NoData));
    let b = expect_query(&env, "b.example.com", RecordType::A);
    env.agent
        .dns_answer(DnsAnswer::records(&b, vec![DnsRecord::a(Ipv4Addr::new(192, 0, 2, 11))]));

    let retry = env.last_request(&Method::Options);
    assert_ne!(retry.branch(), sent.branch());
    assert_eq!(
        env.agent.outgoing_destination(id).unwrap(),
        Some(dest("192.0.2.11:5070"))
    );
    env.deliver(answer(&retry, 200, Some("b")));
    assert_eq!(TestEnv::responses_for(&env.events(), id), vec![(200, false)]);
}

/// Without SRV records the host itself is looked up on the default port
#[test]
fn test_address_fallback_without_srv() {
    let mut env = srv_env();
    options(&mut env, "dns-4");
    let srv = expect_query(&env, "_sip._udp.example.com", RecordType::Srv);
    env.agent.dns_answer(DnsAnswer::error(&srv, LookupError::NoData));
    let a = expect_query(&env, "example.com", RecordType::A);
    env.agent
        .dns_answer(DnsAnswer::records(&a, vec![DnsRecord::a(Ipv4Addr::new(192, 0, 2, 20))]));
    assert_eq!(env.transport.sent()[0].destination, dest("192.0.2.20:5060"));
}

#[test]
fn test_unresolvable_host_gives_local_503() {
    let mut env = srv_env();
    let id = options(&mut env, "dns-5");
    let srv = expect_query(&env, "_sip._udp.example.com", RecordType::Srv);
    env.agent.dns_answer(DnsAnswer::error(&srv, LookupError::NxDomain));
    let a = expect_query(&env, "example.com", RecordType::A);
    env.agent.dns_answer(DnsAnswer::error(&a, LookupError::NxDomain));
    let aaaa = expect_query(&env, "example.com", RecordType::Aaaa);
    env.agent.dns_answer(DnsAnswer::error(&aaaa, LookupError::NxDomain));

    let events = env.events();
    assert_eq!(TestEnv::responses_for(&events, id), vec![(503, true)]);
    let reason = events.iter().find_map(|e| match e {
        AgentEvent::Response { response, .. } => {
            Some(response.reason.clone())
        }
        _ => None,
    });
    assert_eq!(reason.as_deref(), Some("DNS Error"));
    assert!(env.transport.sent().is_empty());

    // Negative answers are cached
    let again = options(&mut env, "dns-6");
    assert!(env.dns.take().is_empty());
    assert_eq!(TestEnv::responses_for(&env.events(), again), vec![(503, true)]);
}

/// A query that never gets an answer is canceled when resolving times out
#[test]
fn test_resolution_timeout_cancels_query() {
    let mut env = srv_env();
    let id = options(&mut env, "dns-7");
    let srv = expect_query(&env, "_sip._udp.example.com", RecordType::Srv);

    env.run_for(env.agent.config().t1x64);
    assert_eq!(env.dns.canceled(), vec![srv.clone()]);
    assert_eq!(TestEnv::responses_for(&env.events(), id), vec![(503, true)]);

    // A late answer is ignored
    env.agent.dns_answer(DnsAnswer::records(&srv, two_targets()));
    assert!(env.dns.take().is_empty());
    assert!(env.transport.sent().is_empty());
}

/// Numeric hosts need no DNS at all
#[test]
fn test_numeric_host_skips_dns() {
    let mut env = srv_env();
    let request = local_request(Method::Options, "sip:bob@192.0.2.30:5080", "dns-8", 1);
    env.agent.request(RequestSpec::new(request)).unwrap();
    assert!(env.dns.take().is_empty());
    assert_eq!(env.transport.sent()[0].destination, dest("192.0.2.30:5080"));
}
