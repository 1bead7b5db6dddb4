// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative macros shared across the domain types.
//!
//! - [`define_id!`] generates a string-newtype identifier
//! - [`tag_display!`] maps enum variants to their wire tags for `Display`
//! - [`builder!`] generates a test-only builder behind the
//!   `test-support` feature
//! - [`setters!`] generates fluent setters on production request types

/// Generate a string-newtype identifier.
///
/// Ids in this system (tasks, groups, workers) are strings on the wire
/// and in the store; the newtype keeps them from being mixed up in
/// signatures. Generated surface: `new`, `as_str`, `short` (prefix for
/// log lines and operator addressing), `Display`, `From<String>`,
/// `From<&str>`, `AsRef<str>`, and `PartialEq` against both `str` and
/// `&str` so tests can assert against literals.
#[macro_export]
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        pub struct $id:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $id(pub String);

        impl $id {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First `n` characters, for compact log lines. Ids here
            /// are ASCII (UUIDs and timestamps), so byte slicing is
            /// character slicing.
            pub fn short(&self, n: usize) -> &str {
                match self.0.char_indices().nth(n) {
                    Some((end, _)) => &self.0[..end],
                    None => &self.0,
                }
            }
        }

        impl std::fmt::Display for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $id {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $id {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $id {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $id {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $id {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

/// Generate a `Display` impl mapping enum variants to wire tags.
///
/// The tags match the serde `snake_case` names, so a status formats
/// the same way in log lines and in the WAL. Data-carrying variants
/// write `(..)` to discard their fields.
#[macro_export]
macro_rules! tag_display {
    ($ty:ty { $( $variant:ident $(( $($skip:tt)* ))? => $tag:literal ),+ $(,)? }) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let tag = match self {
                    $( Self::$variant $(( $($skip)* ))? => $tag, )+
                };
                f.write_str(tag)
            }
        }
    };
}

/// Generate a test builder: struct, `Default` with the given values,
/// one setter per field, and `build()`.
///
/// Gated behind `cfg(any(test, feature = "test-support"))` so test
/// fixtures in other crates can construct domain values without the
/// production constructors' invariant checks.
///
/// Field groups:
/// - `into { field: Type = default }` setter takes `impl Into<Type>`
/// - `set { field: Type = default }` setter takes `Type`
/// - `option { field: Type = default }` stored as `Option<Type>`,
///   setter wraps in `Some(v.into())`
#[macro_export]
macro_rules! builder {
    (
        pub struct $builder:ident => $target:ident {
            $(into {
                $( $ifield:ident : $ity:ty = $idefault:expr ),* $(,)?
            })?
            $(set {
                $( $sfield:ident : $sty:ty = $sdefault:expr ),* $(,)?
            })?
            $(option {
                $( $ofield:ident : $oty:ty = $odefault:expr ),* $(,)?
            })?
        }
    ) => {
        #[cfg(any(test, feature = "test-support"))]
        pub struct $builder {
            $($( $ifield: $ity, )*)?
            $($( $sfield: $sty, )*)?
            $($( $ofield: Option<$oty>, )*)?
        }

        #[cfg(any(test, feature = "test-support"))]
        impl Default for $builder {
            fn default() -> Self {
                Self {
                    $($( $ifield: $idefault.into(), )*)?
                    $($( $sfield: $sdefault, )*)?
                    $($( $ofield: $odefault, )*)?
                }
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        impl $builder {
            $($(
                pub fn $ifield(mut self, value: impl Into<$ity>) -> Self {
                    self.$ifield = value.into();
                    self
                }
            )*)?

            $($(
                pub fn $sfield(mut self, value: $sty) -> Self {
                    self.$sfield = value;
                    self
                }
            )*)?

            $($(
                pub fn $ofield(mut self, value: impl Into<$oty>) -> Self {
                    self.$ofield = Some(value.into());
                    self
                }
            )*)?

            pub fn build(self) -> $target {
                $target {
                    $($( $ifield: self.$ifield, )*)?
                    $($( $sfield: self.$sfield, )*)?
                    $($( $ofield: self.$ofield, )*)?
                }
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        impl $target {
            /// Builder preloaded with test defaults.
            pub fn builder() -> $builder {
                $builder::default()
            }
        }
    };
}

/// Generate fluent setters inside an existing `impl` block.
///
/// Same field groups as [`builder!`], but no struct or defaults: the
/// type's own constructor supplies those. Used on request types such
/// as spawn requests.
#[macro_export]
macro_rules! setters {
    (
        $(set {
            $( $sfield:ident : $sty:ty ),* $(,)?
        })?
        $(option {
            $( $ofield:ident : $oty:ty ),* $(,)?
        })?
    ) => {
        $($(
            pub fn $sfield(mut self, value: $sty) -> Self {
                self.$sfield = value;
                self
            }
        )*)?

        $($(
            pub fn $ofield(mut self, value: impl Into<$oty>) -> Self {
                self.$ofield = Some(value.into());
                self
            }
        )*)?
    };
}
