/// Closed enum carried as a fixed integer in wire records and JSON blobs.
///
/// Both forms generate `TryFrom<repr>` (unknown values become
/// [`XLinkError::UnknownVariant`](crate::error::XLinkError::UnknownVariant))
/// and `From<Self> for repr`. Naming a default variant (`Name: repr = Default`)
/// also generates `Default`, a `Display` that prints the variant name and
/// serde impls that go through the integer. Without one, the caller supplies
/// those through attributes or its own impls.
macro_rules! int_enum {
    (
        $(#[$meta:meta])*
        $name:ident: $repr:ident = $default:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)?
        }
    ) => {
        int_enum!(
            $(#[$meta])*
            $name: $repr {
                $($(#[$vmeta])* $variant = $value),+
            }
        );

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Debug::fmt(self, f)
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                ::serde::Serialize::serialize(&(*self as $repr), s)
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let raw = <$repr as ::serde::Deserialize>::deserialize(d)?;
                $name::try_from(raw).map_err(::serde::de::Error::custom)
            }
        }
    };

    (
        $(#[$meta:meta])*
        $name:ident: $repr:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr($repr)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl TryFrom<$repr> for $name {
            type Error = $crate::error::XLinkError;

            fn try_from(value: $repr) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err($crate::error::XLinkError::UnknownVariant {
                        type_name: stringify!($name),
                        value: value as i64 as u64,
                    }),
                }
            }
        }

        impl From<$name> for $repr {
            fn from(v: $name) -> $repr {
                v as $repr
            }
        }
    };
}
