//! Macros for defining fixed-length token types.

/// Macro to define a random token type of a fixed length.
///
/// This generates a `Copy` newtype over a byte array with:
/// - A `LEN` constant
/// - `generate()` / `generate_with()` to draw a fresh token
/// - `parse()` to validate a string
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations (as a plain string)
///
/// # Example
///
/// ```ignore
/// define_token!(CorrelationId, 10);
///
/// let id = CorrelationId::generate();
/// let parsed: CorrelationId = "Xk4fQ9mT2a".parse()?;
/// ```
#[macro_export]
macro_rules! define_token {
    ($name:ident, $len:literal) => {
        /// A random token of fixed length drawn from the token alphabet.
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            /// Number of characters in the token.
            pub const LEN: usize = $len;

            /// Draws a fresh token from the thread-local RNG.
            #[must_use]
            pub fn generate() -> Self {
                Self::generate_with(&mut $crate::rand::rng())
            }

            /// Draws a fresh token from the given RNG.
            pub fn generate_with<R: $crate::rand::Rng + ?Sized>(rng: &mut R) -> Self {
                let mut bytes = [0u8; $len];
                for b in bytes.iter_mut() {
                    *b = $crate::ALPHABET[rng.random_range(0..$crate::ALPHABET.len())];
                }
                Self(bytes)
            }

            /// Parses a token from a string.
            ///
            /// The string must be exactly `LEN` symbols from the token alphabet.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                if s.len() != $len {
                    return Err($crate::IdError::InvalidLength {
                        expected: $len,
                        actual: s.chars().count(),
                    });
                }

                let mut bytes = [0u8; $len];
                for (position, (slot, b)) in bytes.iter_mut().zip(s.bytes()).enumerate() {
                    if !$crate::is_token_byte(b) {
                        return Err($crate::IdError::InvalidCharacter {
                            character: b as char,
                            position,
                        });
                    }
                    *slot = b;
                }

                Ok(Self(bytes))
            }

            /// Returns the raw token bytes (always ASCII).
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                use std::fmt::Write;
                for &b in &self.0 {
                    f.write_char(b as char)?;
                }
                Ok(())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
