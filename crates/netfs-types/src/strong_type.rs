/// Declares a newtype identifier around an integer.
///
/// The generated type is `Copy`, ordered, hashable, serde-transparent,
/// derefs to the inner value and prints as `Name(v)` under `{:?}`.
#[macro_export]
macro_rules! strong_type {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            #[inline]
            pub const fn raw(self) -> $inner {
                self.0
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(val: $inner) -> Self {
                Self(val)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(val: $name) -> Self {
                val.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    strong_type!(
        /// Doc comments pass through to the generated type.
        SampleId,
        i64
    );

    #[test]
    fn test_strong_type_conversions() {
        let id: SampleId = 17i64.into();
        assert_eq!(*id, 17);
        assert_eq!(id.raw(), 17);
        let raw: i64 = id.into();
        assert_eq!(raw, 17);
    }

    #[test]
    fn test_strong_type_formatting() {
        let id = SampleId(-3);
        assert_eq!(id.to_string(), "-3");
        assert_eq!(format!("{:?}", id), "SampleId(-3)");
    }

    #[test]
    fn test_strong_type_ordering() {
        let set: BTreeSet<SampleId> = [SampleId(9), SampleId(2), SampleId(9)].into_iter().collect();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![SampleId(2), SampleId(9)]);
    }

    #[test]
    fn test_strong_type_serde_is_transparent() {
        let json = serde_json::to_string(&SampleId(42)).unwrap();
        assert_eq!(json, "42");
        let parsed: SampleId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, SampleId(42));
    }
}
