/*!
The [`Value`] type.

Attribute values on [`crate::DataElement`]s are captured as owned [`value_bag::OwnedValueBag`]s, so primitives keep their type for consumers that can use it while anything else is stored as its formatted text.
*/

use std::{borrow::Cow, fmt};

use value_bag::{OwnedValueBag, ValueBag};

/**
An owned, type-erased attribute value.
*/
#[derive(Clone)]
pub struct Value(OwnedValueBag);

impl Value {
    /**
    Capture a value by formatting it with [`fmt::Display`].
    */
    pub fn from_display(value: impl fmt::Display) -> Self {
        Value::from(value.to_string())
    }

    /**
    Capture a value by formatting it with [`fmt::Debug`].
    */
    pub fn from_debug(value: impl fmt::Debug) -> Self {
        Value::from(format!("{value:?}"))
    }

    /**
    Get a borrowed [`ValueBag`] over this value.
    */
    pub fn by_ref(&self) -> ValueBag<'_> {
        self.0.by_ref()
    }

    /**
    Try get the value as a string.

    This only succeeds if the value was captured as a string.
    */
    pub fn to_str(&self) -> Option<Cow<'_, str>> {
        self.0.by_ref().to_str()
    }

    /**
    Try get the value as an unsigned integer.
    */
    pub fn to_u64(&self) -> Option<u64> {
        self.0.by_ref().to_u64()
    }

    /**
    Try get the value as a signed integer.
    */
    pub fn to_i64(&self) -> Option<i64> {
        self.0.by_ref().to_i64()
    }

    /**
    Try get the value as a floating point number.
    */
    pub fn to_f64(&self) -> Option<f64> {
        self.0.by_ref().to_f64()
    }

    /**
    Try get the value as a boolean.
    */
    pub fn to_bool(&self) -> Option<bool> {
        self.0.by_ref().to_bool()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0.by_ref(), f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.by_ref(), f)
    }
}

impl<'a> From<&'a str> for Value {
    fn from(value: &'a str) -> Self {
        Value(ValueBag::from(value).to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::from(&*value)
    }
}

impl<'a> From<Cow<'a, str>> for Value {
    fn from(value: Cow<'a, str>) -> Self {
        Value::from(&*value)
    }
}

impl<'a> From<&'a String> for Value {
    fn from(value: &'a String) -> Self {
        Value::from(&**value)
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value(ValueBag::from(value).to_owned())
                }
            }
        )*
    };
}

impl_from_primitive!(bool, char, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f64);

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::from(value as f64)
    }
}

#[cfg(feature = "sval")]
impl sval::Value for Value {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        stream.value_computed(&self.0.by_ref())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0.by_ref(), serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_keep_their_type() {
        assert_eq!(Some(42), Value::from(42u64).to_u64());
        assert_eq!(Some(-1), Value::from(-1i32).to_i64());
        assert_eq!(Some(true), Value::from(true).to_bool());
        assert_eq!("text", Value::from("text").to_str().unwrap());
    }

    #[test]
    fn display_captures_are_strings() {
        let value = Value::from_display(std::net::Ipv4Addr::LOCALHOST);

        assert_eq!("127.0.0.1", value.to_str().unwrap());
        assert_eq!("127.0.0.1", value.to_string());
    }
}
