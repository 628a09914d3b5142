//! Defines [visa attributes](attribute), [visa status](status) and
//! [trigger protocols](assert) as Rust enums

macro_rules! consts_to_enum {
    {
        doc
        $(#[$metas:meta])*
        pub enum $enum_id:ident: $repr:ty {
            $($variant:ident $value:literal $des:literal)*
        }
    } => {
        $(#[$metas])*
        #[derive(num_enum::TryFromPrimitive, num_enum::IntoPrimitive, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
        #[repr($repr)]
        pub enum $enum_id {
            $(
                #[doc=$des]
                $variant = $value
            ),*
        }
        impl ::std::fmt::Display for $enum_id {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(
                    f,
                    "{}",
                    match self {
                        $(Self::$variant => $des),*
                    }
                )
            }
        }
        impl ::std::fmt::Debug for $enum_id {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, "{}: {}", std::stringify!($variant), $des)),*
                }
            }
        }
    };

    {
        $(#[$metas:meta])*
        pub enum $enum_id:ident: $repr:ty {
            $($variant:ident $value:literal)*
        }
    } => {
        $(#[$metas])*
        #[derive(num_enum::TryFromPrimitive, num_enum::IntoPrimitive, Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
        #[repr($repr)]
        pub enum $enum_id {
            $($variant = $value),*
        }
    };
}

pub mod assert;
pub mod attribute;
pub mod status;
