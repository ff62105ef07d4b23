//! Dialog and destination legs
//!
//! A leg is either a dialog, found by Call-ID and tags, or a dialogless
//! destination, found by the Request-URI of incoming requests. Legs keep
//! the route set and remote target learned from Record-Route and Contact
//! so in-dialog requests can be routed without the application rebuilding
//! them.
//!
//! ## Matching incoming requests
//!
//! The request's To tag is compared with the leg's local tag and its From
//! tag with the remote tag. A leg whose tags both agree is a perfect
//! match. A leg where one side is still untagged (the remote tag before
//! the first response, or a local tag added after the leg was created) is
//! kept as a loose match and used only if no perfect match exists.
//!
//! Destination legs are looked up by scheme, host and user; a second pass
//! ignores the user so legs created without one act as wildcards. The
//! default leg catches everything else.

use siptx_sip_core::{generate_tag, CSeq, Method, NameAddr, Request, Response, Uri};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::hash::{hash_istring, HashTable};
use crate::queue::{Arena, LegId};

/// Parameters of a new leg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegSpec {
    /// Dialog legs have a Call-ID; destination legs do not
    pub call_id: Option<String>,
    /// Our address; its tag is the local tag
    pub local: Option<NameAddr>,
    /// The peer's address; its tag is the remote tag
    pub remote: Option<NameAddr>,
    /// Request-URI served by a destination leg. No user part means any user.
    pub uri: Option<Uri>,
    /// Only match requests with this method
    pub method: Option<Method>,
    /// First CSeq number for requests sent on the leg
    pub cseq: Option<u32>,
}

impl LegSpec {
    pub fn dialog(call_id: impl Into<String>, local: NameAddr, remote: NameAddr) -> Self {
        LegSpec {
            call_id: Some(call_id.into()),
            local: Some(local),
            remote: Some(remote),
            ..LegSpec::default()
        }
    }

    pub fn destination(uri: Uri) -> Self {
        LegSpec {
            uri: Some(uri),
            ..LegSpec::default()
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_cseq(mut self, cseq: u32) -> Self {
        self.cseq = Some(cseq);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Leg {
    pub call_id: Option<String>,
    pub local: Option<NameAddr>,
    pub remote: Option<NameAddr>,
    pub uri: Option<Uri>,
    pub method: Option<Method>,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    /// Local tag added after creation
    pub tagged: bool,
    /// Route set in the order requests use it
    pub route: Vec<NameAddr>,
    pub target: Option<Uri>,
    /// Route set fixed by a 2xx or by the dialog creating request
    pub route_fixed: bool,
    pub next_cseq: u32,
    hash: u32,
}

impl Leg {
    fn is_dialog(&self) -> bool {
        self.call_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagMatch {
    Exact,
    Loose,
    Mismatch,
}

fn eq_tag(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Leg tag against the tag carried by a request
fn local_match(leg: &Leg, to_tag: Option<&str>) -> TagMatch {
    match (leg.local_tag.as_deref(), to_tag) {
        (Some(a), Some(b)) if eq_tag(a, b) => TagMatch::Exact,
        (Some(_), Some(_)) => TagMatch::Mismatch,
        (None, None) => TagMatch::Exact,
        (None, Some(_)) => TagMatch::Mismatch,
        (Some(_), None) if leg.tagged => TagMatch::Loose,
        (Some(_), None) => TagMatch::Mismatch,
    }
}

fn remote_match(leg: &Leg, from_tag: Option<&str>) -> TagMatch {
    match (leg.remote_tag.as_deref(), from_tag) {
        (Some(a), Some(b)) if eq_tag(a, b) => TagMatch::Exact,
        (Some(_), Some(_)) => TagMatch::Mismatch,
        (None, None) => TagMatch::Exact,
        (Some(_), None) => TagMatch::Mismatch,
        (None, Some(_)) => TagMatch::Loose,
    }
}

fn destination_hash(uri: &Uri, user: Option<&str>) -> u32 {
    hash_istring(&format!("{}:{}@{}", uri.scheme, user.unwrap_or(""), uri.host))
}

/// All legs of an agent and their lookup tables
#[derive(Debug, Default)]
pub(crate) struct LegTable {
    legs: Arena<Leg>,
    dialogs: HashTable<LegId>,
    destinations: HashTable<LegId>,
    default: Option<LegId>,
}

impl LegTable {
    pub fn create(&mut self, spec: LegSpec) -> LegId {
        let local_tag = spec.local.as_ref().and_then(|a| a.tag()).map(str::to_string);
        let remote_tag = spec.remote.as_ref().and_then(|a| a.tag()).map(str::to_string);
        let hash = match (&spec.call_id, &spec.uri) {
            (Some(call_id), _) => hash_istring(call_id),
            (None, Some(uri)) => destination_hash(uri, uri.user.as_deref()),
            (None, None) => 0,
        };
        let target = spec.remote.as_ref().map(|r| r.uri.clone());
        let leg = Leg {
            call_id: spec.call_id,
            local: spec.local.map(|a| a.without_tag()),
            remote: spec.remote.map(|a| a.without_tag()),
            uri: spec.uri,
            method: spec.method,
            local_tag,
            remote_tag,
            tagged: false,
            route: Vec::new(),
            target,
            route_fixed: false,
            next_cseq: spec.cseq.unwrap_or_else(|| rand::random::<u32>() & 0x7fff_ffff),
            hash,
        };
        let is_dialog = leg.is_dialog();
        let has_uri = leg.uri.is_some();
        let id = LegId(self.legs.insert(leg));
        if is_dialog {
            self.dialogs.insert(hash, id);
        } else if has_uri {
            self.destinations.insert(hash, id);
        }
        debug!(leg = %id, dialog = is_dialog, "leg created");
        id
    }

    pub fn destroy(&mut self, id: LegId) -> bool {
        let Some(leg) = self.legs.remove(id.0) else {
            return false;
        };
        if leg.is_dialog() {
            self.dialogs.remove(leg.hash, id);
        } else if leg.uri.is_some() {
            self.destinations.remove(leg.hash, id);
        }
        if self.default == Some(id) {
            self.default = None;
        }
        debug!(leg = %id, "leg destroyed");
        true
    }

    pub fn get(&self, id: LegId) -> Option<&Leg> {
        self.legs.get(id.0)
    }

    pub fn get_mut(&mut self, id: LegId) -> Option<&mut Leg> {
        self.legs.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.legs.len()
    }

    pub fn set_default(&mut self, id: LegId) -> Result<()> {
        if !self.legs.contains(id.0) {
            return Err(Error::LegNotFound(id.to_string()));
        }
        self.default = Some(id);
        Ok(())
    }

    pub fn default_leg(&self) -> Option<LegId> {
        self.default
    }

    /// Give the leg a local tag, generating one if `tag` is `None`
    pub fn tag(&mut self, id: LegId, tag: Option<&str>) -> Result<String> {
        let leg = self
            .legs
            .get_mut(id.0)
            .ok_or_else(|| Error::LegNotFound(id.to_string()))?;
        match (&leg.local_tag, tag) {
            (Some(existing), Some(wanted)) if !eq_tag(existing, wanted) => Err(Error::InvalidState(
                format!("leg {} already tagged {}", id, existing),
            )),
            (Some(existing), _) => Ok(existing.clone()),
            (None, wanted) => {
                let tag = wanted.map(str::to_string).unwrap_or_else(generate_tag);
                leg.local_tag = Some(tag.clone());
                leg.tagged = true;
                trace!(leg = %id, tag = %tag, "leg tagged");
                Ok(tag)
            }
        }
    }

    /// Dialog leg for a Call-ID and the tags as seen from this side
    pub fn find_dialog(
        &self,
        call_id: &str,
        local_tag: Option<&str>,
        remote_tag: Option<&str>,
        method: Option<&Method>,
    ) -> Option<LegId> {
        let mut loose = None;
        for id in self.dialogs.candidates(hash_istring(call_id)) {
            let Some(leg) = self.legs.get(id.0) else {
                continue;
            };
            if leg.call_id.as_deref() != Some(call_id) {
                continue;
            }
            if let (Some(wanted), Some(method)) = (&leg.method, method) {
                if wanted != method {
                    continue;
                }
            }
            match (local_match(leg, local_tag), remote_match(leg, remote_tag)) {
                (TagMatch::Exact, TagMatch::Exact) => return Some(id),
                (TagMatch::Mismatch, _) | (_, TagMatch::Mismatch) => {}
                _ => {
                    loose.get_or_insert(id);
                }
            }
        }
        loose
    }

    /// Destination leg for a Request-URI
    pub fn find_destination(&self, uri: &Uri, method: &Method) -> Option<LegId> {
        let method_ok = |leg: &Leg| leg.method.as_ref().map_or(true, |m| m == method);
        let same_host = |leg: &Leg| {
            leg.uri
                .as_ref()
                .is_some_and(|u| u.scheme == uri.scheme && u.host.eq_ignore_ascii_case(&uri.host))
        };

        if let Some(user) = uri.user.as_deref() {
            let found = self.destinations.find(destination_hash(uri, Some(user)), |id| {
                self.legs.get(id.0).is_some_and(|leg| {
                    same_host(leg)
                        && leg.uri.as_ref().and_then(|u| u.user.as_deref()) == Some(user)
                        && method_ok(leg)
                })
            });
            if found.is_some() {
                return found;
            }
        }
        self.destinations.find(destination_hash(uri, None), |id| {
            self.legs.get(id.0).is_some_and(|leg| {
                same_host(leg)
                    && leg.uri.as_ref().is_some_and(|u| u.user.is_none())
                    && method_ok(leg)
            })
        })
    }

    /// Leg an incoming request belongs to, if any
    pub fn match_request(&self, request: &Request) -> Option<LegId> {
        let to_tag = request.headers.to_tag();
        let from_tag = request.headers.from_tag();
        if let Some(call_id) = request.call_id() {
            if let Some(id) = self.find_dialog(call_id, to_tag, from_tag, Some(&request.method)) {
                return Some(id);
            }
        }
        if to_tag.is_some() {
            return None;
        }
        self.find_destination(&request.uri, &request.method)
    }

    /// Learn the route set and target from a response to our request
    pub fn client_route(&mut self, id: LegId, response: &Response) -> Result<()> {
        let leg = self
            .legs
            .get_mut(id.0)
            .ok_or_else(|| Error::LegNotFound(id.to_string()))?;
        if leg.remote_tag.is_none() {
            leg.remote_tag = response.headers.to_tag().map(str::to_string);
        }
        if leg.route_fixed {
            return Ok(());
        }
        leg.route = response.headers.record_route.iter().rev().cloned().collect();
        if let Some(contact) = response.headers.contact.first() {
            leg.target = Some(contact.uri.clone());
        }
        leg.route_fixed = response.is_success();
        trace!(leg = %id, routes = leg.route.len(), fixed = leg.route_fixed, "client route");
        Ok(())
    }

    /// Learn the route set and target from a dialog creating request
    pub fn server_route(&mut self, id: LegId, request: &Request) -> Result<()> {
        let leg = self
            .legs
            .get_mut(id.0)
            .ok_or_else(|| Error::LegNotFound(id.to_string()))?;
        if leg.remote_tag.is_none() {
            leg.remote_tag = request.headers.from_tag().map(str::to_string);
        }
        leg.route = request.headers.record_route.clone();
        if let Some(contact) = request.headers.contact.first() {
            leg.target = Some(contact.uri.clone());
        }
        leg.route_fixed = true;
        trace!(leg = %id, routes = leg.route.len(), "server route");
        Ok(())
    }

    /// Fill in the dialog headers and routing of a request sent on the leg
    pub fn prepare_request(&mut self, id: LegId, request: &mut Request) -> Result<()> {
        let leg = self
            .legs
            .get_mut(id.0)
            .ok_or_else(|| Error::LegNotFound(id.to_string()))?;
        if !leg.is_dialog() {
            return Ok(());
        }
        request.headers.call_id = leg.call_id.clone();
        if let Some(local) = &leg.local {
            let mut from = local.clone();
            if let Some(tag) = &leg.local_tag {
                from.set_tag(tag);
            }
            request.headers.from = Some(from);
        }
        if let Some(remote) = &leg.remote {
            let mut to = remote.clone();
            if let Some(tag) = &leg.remote_tag {
                to.set_tag(tag);
            }
            request.headers.to = Some(to);
        }
        // ACK and CANCEL reuse the CSeq of the request they belong to
        if !matches!(request.method, Method::Ack | Method::Cancel) {
            let seq = leg.next_cseq;
            leg.next_cseq = leg.next_cseq.wrapping_add(1);
            request.headers.cseq = Some(CSeq::new(seq, request.method.clone()));
        }

        let target = leg.target.clone().unwrap_or_else(|| request.uri.clone());
        match leg.route.first() {
            Some(first) if !first.uri.is_loose_route() => {
                // Strict router: it becomes the Request-URI, the target goes last
                request.uri = first.uri.without_params();
                let mut route: Vec<NameAddr> = leg.route[1..].to_vec();
                route.push(NameAddr::new(target));
                request.headers.route = route;
            }
            _ => {
                request.uri = target;
                request.headers.route = leg.route.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siptx_sip_core::ResponseBuilder;

    fn addr(s: &str) -> NameAddr {
        s.parse().unwrap()
    }

    fn dialog_spec(local_tag: Option<&str>, remote_tag: Option<&str>) -> LegSpec {
        let mut local = addr("<sip:alice@example.com>");
        if let Some(t) = local_tag {
            local.set_tag(t);
        }
        let mut remote = addr("<sip:bob@example.org>");
        if let Some(t) = remote_tag {
            remote.set_tag(t);
        }
        LegSpec::dialog("call-1@example.com", local, remote)
    }

    #[test]
    fn test_perfect_match_beats_loose() {
        let mut table = LegTable::default();
        let loose = table.create(dialog_spec(Some("l1"), None));
        let perfect = table.create(dialog_spec(Some("l1"), Some("r1")));
        assert_eq!(
            table.find_dialog("call-1@example.com", Some("l1"), Some("r1"), None),
            Some(perfect)
        );
        // Remote tag unknown to the first leg: loose match only
        assert_eq!(
            table.find_dialog("call-1@example.com", Some("l1"), Some("r9"), None),
            Some(loose)
        );
        assert_eq!(
            table.find_dialog("call-1@example.com", Some("other"), Some("r1"), None),
            None
        );
    }

    #[test]
    fn test_untagged_local_does_not_match_tagged_request() {
        let mut table = LegTable::default();
        let id = table.create(dialog_spec(None, Some("r1")));
        assert_eq!(table.find_dialog("call-1@example.com", Some("x"), Some("r1"), None), None);
        assert_eq!(table.find_dialog("call-1@example.com", None, Some("r1"), None), Some(id));

        // A tag added later still lets untagged retransmissions in
        let tag = table.tag(id, None).unwrap();
        assert_eq!(
            table.find_dialog("call-1@example.com", Some(&tag), Some("r1"), None),
            Some(id)
        );
        assert_eq!(table.find_dialog("call-1@example.com", None, Some("r1"), None), Some(id));
        assert!(table.tag(id, Some("different")).is_err());
        assert_eq!(table.tag(id, Some(&tag)).unwrap(), tag);
    }

    #[test]
    fn test_destination_wildcard_and_default() {
        let mut table = LegTable::default();
        let bob = table.create(LegSpec::destination("sip:bob@example.com".parse().unwrap()));
        let any = table.create(LegSpec::destination("sip:example.com".parse().unwrap()));
        let fallback = table.create(LegSpec::default());
        table.set_default(fallback).unwrap();

        let method = Method::Invite;
        assert_eq!(
            table.find_destination(&"sip:bob@EXAMPLE.com".parse().unwrap(), &method),
            Some(bob)
        );
        assert_eq!(
            table.find_destination(&"sip:carol@example.com".parse().unwrap(), &method),
            Some(any)
        );
        assert_eq!(table.find_destination(&"sip:bob@other.net".parse().unwrap(), &method), None);
        assert_eq!(table.default_leg(), Some(fallback));

        assert!(table.destroy(any));
        assert_eq!(
            table.find_destination(&"sip:carol@example.com".parse().unwrap(), &method),
            None
        );
        assert!(table.destroy(fallback));
        assert_eq!(table.default_leg(), None);
    }

    #[test]
    fn test_method_filter() {
        let mut table = LegTable::default();
        let id = table.create(
            LegSpec::destination("sip:example.com".parse().unwrap()).with_method(Method::Options),
        );
        let uri: Uri = "sip:example.com".parse().unwrap();
        assert_eq!(table.find_destination(&uri, &Method::Options), Some(id));
        assert_eq!(table.find_destination(&uri, &Method::Invite), None);
    }

    #[test]
    fn test_client_route_loose_and_strict() {
        let mut table = LegTable::default();
        let id = table.create(dialog_spec(Some("l1"), None).with_cseq(10));

        let invite = siptx_sip_core::RequestBuilder::new(Method::Invite, "sip:bob@example.org")
            .unwrap()
            .from("<sip:alice@example.com>", Some("l1"))
            .unwrap()
            .to("<sip:bob@example.org>", None)
            .unwrap()
            .call_id("call-1@example.com")
            .cseq(9)
            .build()
            .unwrap();
        let response = ResponseBuilder::from_request(&invite, 200)
            .to_tag("r1")
            .record_route(vec![
                addr("<sip:p2.example.org;lr>"),
                addr("<sip:p1.example.com;lr>"),
            ])
            .contact(addr("<sip:bob@192.0.2.20:5060>"))
            .build();
        table.client_route(id, &response).unwrap();

        let mut bye = Request::new(Method::Bye, "sip:placeholder".parse().unwrap());
        table.prepare_request(id, &mut bye).unwrap();
        assert_eq!(bye.uri.to_string(), "sip:bob@192.0.2.20:5060");
        assert_eq!(bye.headers.route[0].uri.host, "p1.example.com");
        assert_eq!(bye.headers.route[1].uri.host, "p2.example.org");
        assert_eq!(bye.headers.to_tag(), Some("r1"));
        assert_eq!(bye.headers.from_tag(), Some("l1"));
        assert_eq!(bye.cseq().unwrap().seq, 10);

        // A later provisional must not change the fixed route set
        let ringing = ResponseBuilder::from_request(&invite, 180).to_tag("r1").build();
        table.client_route(id, &ringing).unwrap();
        assert_eq!(table.get(id).unwrap().route.len(), 2);

        // Strict router in front
        let strict = table.create(dialog_spec(Some("l2"), Some("r2")));
        let mut request = invite.clone();
        request.headers.record_route = vec![addr("<sip:strict.example.net>")];
        request.headers.contact = vec![addr("<sip:carol@192.0.2.30>")];
        table.server_route(strict, &request).unwrap();
        let mut info = Request::new(Method::Info, "sip:placeholder".parse().unwrap());
        table.prepare_request(strict, &mut info).unwrap();
        assert_eq!(info.uri.host, "strict.example.net");
        assert_eq!(info.headers.route.len(), 1);
        assert_eq!(info.headers.route[0].uri.host, "192.0.2.30");
    }

    #[test]
    fn test_match_request_prefers_dialog() {
        let mut table = LegTable::default();
        let dest = table.create(LegSpec::destination("sip:bob@example.org".parse().unwrap()));
        let dialog = table.create(dialog_spec(Some("l1"), Some("r1")));

        let mut request = siptx_sip_core::RequestBuilder::new(Method::Bye, "sip:bob@example.org")
            .unwrap()
            .from("<sip:bob@example.org>", Some("r1"))
            .unwrap()
            .to("<sip:alice@example.com>", Some("l1"))
            .unwrap()
            .call_id("call-1@example.com")
            .cseq(2)
            .build()
            .unwrap();
        assert_eq!(table.match_request(&request), Some(dialog));

        request.headers.to = Some(addr("<sip:alice@example.com>;tag=zz"));
        assert_eq!(table.match_request(&request), None);

        request.headers.to = Some(addr("<sip:alice@example.com>"));
        request.headers.call_id = Some("fresh".into());
        assert_eq!(table.match_request(&request), Some(dest));
    }
}
