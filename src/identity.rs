/// An authenticated principal attached to a connection by `sign_in`. The
///  protocol core treats it as opaque; it only uses the two accessors to
///  derive the identity channels a signed-in connection joins.
pub trait Identity: Send + Sync {
    /// A stable pointer to this identity, unique within its model.
    fn id(&self) -> i64;

    /// The kind of principal, e.g. "user". Becomes part of the channel
    ///  names `model_{model_name}` and `model_{model_name}:{id}`.
    fn model_name(&self) -> &str;
}

/// Channel joined by every connection signed in with an identity of the
///  same model.
pub fn model_channel(identity: &dyn Identity) -> String {
    format!("model_{}", identity.model_name())
}

/// Channel joined by every connection signed in as this exact identity.
pub fn identity_channel(identity: &dyn Identity) -> String {
    format!("model_{}:{}", identity.model_name(), identity.id())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct TestIdentity {
        pub id: i64,
        pub model: &'static str,
    }

    impl Identity for TestIdentity {
        fn id(&self) -> i64 {
            self.id
        }

        fn model_name(&self) -> &str {
            self.model
        }
    }
}
