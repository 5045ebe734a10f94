//! Predicate marker messages (`intake.v1.relation`).
//!
//! A relationship's predicate is an [`Any`](crate::Any) whose type URL names
//! the edge kind. Markers carry no fields today; the type URL alone is the
//! edge identity, and markers may grow fields without breaking stored edges.

macro_rules! predicate {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, ::prost::Message)]
        pub struct $name {}

        impl ::prost::Name for $name {
            const NAME: &'static str = stringify!($name);
            const PACKAGE: &'static str = "intake.v1.relation";
        }
    };
}

predicate!(
    /// Subject (a cluster) contains the object.
    Contains
);
predicate!(
    /// Subject is contained by the object (a cluster).
    ContainedBy
);
predicate!(
    /// Subject is a controller owning the object.
    Owns
);
predicate!(
    /// Subject is owned by the object controller.
    OwnedBy
);
predicate!(
    /// Subject (a pod) mounts the object (a persistent volume claim).
    VolumeMount
);
predicate!(
    /// Subject (a persistent volume claim) is attached to the object (a pod).
    AttachedTo
);
predicate!(
    /// Subject (a claim) draws storage from the object (a persistent volume).
    ClaimsFrom
);
predicate!(
    /// Subject (a persistent volume) is bound by the object (a claim).
    BoundBy
);

#[cfg(test)]
mod test {
    use super::*;
    use prost::Name;

    #[test]
    fn full_names() {
        assert_eq!(Contains::full_name(), "intake.v1.relation.Contains");
        assert_eq!(BoundBy::full_name(), "intake.v1.relation.BoundBy");
    }
}
