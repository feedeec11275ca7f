//! Who may create, update or delete resources and reservations.
//!
//! Reads are never gated. Update and delete share one rule per entity type.

use crate::model::{Actor, Reservation, ResourceState};

/// Per-statement authorization input. The credential is whatever the caller
/// attached to this one statement; it is never stored on the connection.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub actor: &'a Actor,
    pub credential: Option<&'a str>,
}

impl<'a> RequestContext<'a> {
    pub fn new(actor: &'a Actor) -> Self {
        Self {
            actor,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Option<&'a str>) -> Self {
        self.credential = credential;
        self
    }
}

pub trait Policy {
    type Target;

    fn can_create(ctx: &RequestContext<'_>) -> bool;

    /// `target == None` is the coarse check made before an instance is loaded.
    fn can_modify(ctx: &RequestContext<'_>, target: Option<&Self::Target>) -> bool;
}

pub struct ResourcePolicy;

impl Policy for ResourcePolicy {
    type Target = ResourceState;

    fn can_create(ctx: &RequestContext<'_>) -> bool {
        ctx.actor.is_authenticated()
    }

    fn can_modify(ctx: &RequestContext<'_>, target: Option<&ResourceState>) -> bool {
        match (ctx.actor.account(), target) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(account), Some(rs)) => rs.owner == account,
        }
    }
}

pub struct ReservationPolicy;

impl Policy for ReservationPolicy {
    type Target = Reservation;

    fn can_create(_ctx: &RequestContext<'_>) -> bool {
        true
    }

    fn can_modify(ctx: &RequestContext<'_>, target: Option<&Reservation>) -> bool {
        let Some(reservation) = target else {
            return true;
        };
        match &reservation.owner {
            // Owned bookings are exclusive to the logged-in owner; a credential
            // is never consulted here, even a correct one.
            Some(owner) => ctx.actor.account() == Some(owner.as_str()),
            None => ctx
                .credential
                .is_some_and(|presented| presented == reservation.credential),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    fn user(name: &str) -> Actor {
        Actor::Authenticated(name.into())
    }

    fn resource(owner: &str) -> ResourceState {
        ResourceState::new(Ulid::new(), "Spectrometer".into(), String::new(), owner.into(), 0)
    }

    fn reservation(owner: Option<&str>) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            name: "Ayumi".into(),
            contact: "ext. 4411".into(),
            remarks: String::new(),
            span: Span::new(0, 1000),
            owner: owner.map(Into::into),
            credential: "5f0c8a6e-1d4b-4c3e-9a57-2b7c1e0d9f31".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn resource_create_requires_login() {
        assert!(ResourcePolicy::can_create(&RequestContext::new(&user("alice"))));
        assert!(!ResourcePolicy::can_create(&RequestContext::new(&Actor::Anonymous)));
    }

    #[test]
    fn resource_modify_owner_only() {
        let rs = resource("alice");
        let alice = user("alice");
        let bob = user("bob");
        let anon = Actor::Anonymous;

        assert!(ResourcePolicy::can_modify(&RequestContext::new(&alice), Some(&rs)));
        assert!(!ResourcePolicy::can_modify(&RequestContext::new(&bob), Some(&rs)));
        assert!(!ResourcePolicy::can_modify(&RequestContext::new(&anon), Some(&rs)));

        // Coarse check only asks for a login.
        assert!(ResourcePolicy::can_modify(&RequestContext::new(&bob), None));
        assert!(!ResourcePolicy::can_modify(&RequestContext::new(&anon), None));
    }

    #[test]
    fn reservation_create_open_to_everyone() {
        assert!(ReservationPolicy::can_create(&RequestContext::new(&user("alice"))));
        assert!(ReservationPolicy::can_create(&RequestContext::new(&Actor::Anonymous)));
    }

    #[test]
    fn reservation_coarse_check_always_allows() {
        assert!(ReservationPolicy::can_modify(&RequestContext::new(&Actor::Anonymous), None));
        assert!(ReservationPolicy::can_modify(&RequestContext::new(&user("bob")), None));
    }

    #[test]
    fn owned_reservation_ignores_credential() {
        let r = reservation(Some("alice"));
        let alice = user("alice");
        let bob = user("bob");
        let anon = Actor::Anonymous;
        let right = Some(r.credential.as_str());

        assert!(ReservationPolicy::can_modify(&RequestContext::new(&alice), Some(&r)));
        assert!(!ReservationPolicy::can_modify(&RequestContext::new(&bob), Some(&r)));
        assert!(!ReservationPolicy::can_modify(
            &RequestContext::new(&bob).with_credential(right),
            Some(&r)
        ));
        assert!(!ReservationPolicy::can_modify(
            &RequestContext::new(&anon).with_credential(right),
            Some(&r)
        ));
    }

    #[test]
    fn anonymous_reservation_gated_by_credential() {
        let r = reservation(None);
        let right = Some(r.credential.as_str());
        let wrong = Some("00000000-0000-4000-8000-000000000000");

        for actor in [Actor::Anonymous, user("alice")] {
            assert!(ReservationPolicy::can_modify(
                &RequestContext::new(&actor).with_credential(right),
                Some(&r)
            ));
            assert!(!ReservationPolicy::can_modify(
                &RequestContext::new(&actor).with_credential(wrong),
                Some(&r)
            ));
            assert!(!ReservationPolicy::can_modify(&RequestContext::new(&actor), Some(&r)));
        }
    }

    #[test]
    fn credential_match_is_exact() {
        let r = reservation(None);
        let upper = r.credential.to_uppercase();
        let padded = format!(" {}", r.credential);
        assert!(!ReservationPolicy::can_modify(
            &RequestContext::new(&Actor::Anonymous).with_credential(Some(&upper)),
            Some(&r)
        ));
        assert!(!ReservationPolicy::can_modify(
            &RequestContext::new(&Actor::Anonymous).with_credential(Some(&padded)),
            Some(&r)
        ));
    }
}
