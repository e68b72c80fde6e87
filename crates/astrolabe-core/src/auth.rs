/// Supplies the bearer token sent with every `interpret` request.
///
/// Acquiring and refreshing tokens belongs to the hosting application; the
/// client only asks for the current value at submit time.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A token fixed at construction, e.g. from the config file or a CLI flag
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        // Blank tokens are treated as absent
        Self(token.filter(|t| !t.trim().is_empty()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}
