use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps a payout destination (UPI address, account number) so that log
/// macros only ever see the last four characters.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T: AsRef<str>> Masked<T> {
    fn tail(&self) -> String {
        let raw = self.0.as_ref();
        let visible: String = raw.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        if raw.chars().count() <= 4 {
            "****".to_string()
        } else {
            format!("****{}", visible)
        }
    }
}

impl<T: AsRef<str>> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Masked({})", self.tail())
    }
}

impl<T: AsRef<str>> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tail())
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Providers and owners need the real value; masking is for logs only.
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}
