/*!
The [`DataElement`] type.

Events carry a tree of named elements as their payload. Each element may hold some text, an ordered list of attributes, and an ordered list of child elements. The tree isn't tied to any serialization format; persisters decide how to render it.
*/

use std::fmt;

use crate::value::Value;

/**
A named node in an event's data tree.
*/
#[derive(Clone)]
pub struct DataElement {
    name: String,
    text: Option<String>,
    attributes: Vec<(String, Value)>,
    children: Vec<DataElement>,
}

impl DataElement {
    /**
    Create a new element with no text, attributes, or children.
    */
    pub fn new(name: impl Into<String>) -> Self {
        DataElement {
            name: name.into(),
            text: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /**
    The name of this element.
    */
    pub fn name(&self) -> &str {
        &self.name
    }

    /**
    The text content of this element, if any.
    */
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /**
    Set the text content of this element, replacing any previous text.
    */
    pub fn set_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(text.into());
        self
    }

    /**
    Set an attribute on this element.

    If an attribute with the same name is already present then its value is replaced in place, keeping its original position.
    */
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let name = name.into();
        let value = value.into();

        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((name, value)),
        }

        self
    }

    /**
    Get the value of an attribute by name.
    */
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /**
    Iterate over attributes in the order they were first added.
    */
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (&**k, v))
    }

    /**
    Append a new, empty child element and return it.
    */
    pub fn add_element(&mut self, name: impl Into<String>) -> &mut DataElement {
        self.push_element(DataElement::new(name))
    }

    /**
    Append an existing element as a child and return it.
    */
    pub fn push_element(&mut self, element: DataElement) -> &mut DataElement {
        self.children.push(element);

        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /**
    The children of this element in the order they were added.
    */
    pub fn children(&self) -> &[DataElement] {
        &self.children
    }

    /**
    Find the first child with the given name.
    */
    pub fn find(&self, name: &str) -> Option<&DataElement> {
        self.children.iter().find(|child| child.name == name)
    }

    /**
    Find the first child with the given name.
    */
    pub fn find_mut(&mut self, name: &str) -> Option<&mut DataElement> {
        self.children.iter_mut().find(|child| child.name == name)
    }

    /**
    Iterate over all children with the given name.
    */
    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DataElement> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /**
    Whether this element has no text, attributes, or children.
    */
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.attributes.is_empty() && self.children.is_empty()
    }

    /**
    Remove all text, attributes, and children, keeping the name.
    */
    pub fn clear(&mut self) {
        self.text = None;
        self.attributes.clear();
        self.children.clear();
    }
}

impl fmt::Debug for DataElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/**
Renders as `name(key=value, ..)="text"[child, ..]`, omitting empty parts.
*/
impl fmt::Display for DataElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;

        if !self.attributes.is_empty() {
            f.write_str("(")?;

            let mut first = true;
            for (k, v) in &self.attributes {
                if !first {
                    f.write_str(", ")?;
                }
                first = false;

                write!(f, "{k}={v:?}")?;
            }

            f.write_str(")")?;
        }

        if let Some(ref text) = self.text {
            write!(f, "={text:?}")?;
        }

        if !self.children.is_empty() {
            f.write_str("[")?;

            let mut first = true;
            for child in &self.children {
                if !first {
                    f.write_str(", ")?;
                }
                first = false;

                fmt::Display::fmt(child, f)?;
            }

            f.write_str("]")?;
        }

        Ok(())
    }
}

#[cfg(feature = "sval")]
impl sval::Value for DataElement {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        stream.record_begin(None, None, None, None)?;

        stream.record_value_begin(None, &sval::Label::new("name"))?;
        stream.value_computed(&*self.name)?;
        stream.record_value_end(None, &sval::Label::new("name"))?;

        if let Some(ref text) = self.text {
            stream.record_value_begin(None, &sval::Label::new("text"))?;
            stream.value_computed(&**text)?;
            stream.record_value_end(None, &sval::Label::new("text"))?;
        }

        if !self.attributes.is_empty() {
            stream.record_value_begin(None, &sval::Label::new("attributes"))?;
            stream.record_begin(None, None, None, Some(self.attributes.len()))?;

            for (k, v) in &self.attributes {
                stream.record_value_begin(None, &sval::Label::new_computed(k))?;
                stream.value_computed(v)?;
                stream.record_value_end(None, &sval::Label::new_computed(k))?;
            }

            stream.record_end(None, None, None)?;
            stream.record_value_end(None, &sval::Label::new("attributes"))?;
        }

        if !self.children.is_empty() {
            stream.record_value_begin(None, &sval::Label::new("children"))?;
            stream.seq_begin(Some(self.children.len()))?;

            for child in &self.children {
                stream.seq_value_begin()?;
                stream.value_computed(child)?;
                stream.seq_value_end()?;
            }

            stream.seq_end()?;
            stream.record_value_end(None, &sval::Label::new("children"))?;
        }

        stream.record_end(None, None, None)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for DataElement {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        struct Attributes<'a>(&'a [(String, Value)]);

        impl<'a> serde::Serialize for Attributes<'a> {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
            }
        }

        let mut map = serializer.serialize_map(None)?;

        map.serialize_entry("name", &self.name)?;

        if let Some(ref text) = self.text {
            map.serialize_entry("text", text)?;
        }

        if !self.attributes.is_empty() {
            map.serialize_entry("attributes", &Attributes(&self.attributes))?;
        }

        if !self.children.is_empty() {
            map.serialize_entry("children", &self.children)?;
        }

        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_overwrite_in_place() {
        let mut element = DataElement::new("request");

        element.add("uri", "/a").add("method", "GET").add("uri", "/b");

        let attributes: Vec<_> = element
            .attributes()
            .map(|(k, v)| (k.to_owned(), v.to_string()))
            .collect();

        assert_eq!(
            vec![
                ("uri".to_owned(), "/b".to_owned()),
                ("method".to_owned(), "GET".to_owned())
            ],
            attributes
        );
    }

    #[test]
    fn children_keep_insertion_order() {
        let mut element = DataElement::new("parameters");

        for i in 0..5 {
            element.add_element("param").add("index", i);
        }

        let indexes: Vec<_> = element
            .find_all("param")
            .filter_map(|param| param.attribute("index")?.to_u64())
            .collect();

        assert_eq!(vec![0, 1, 2, 3, 4], indexes);
    }

    #[test]
    fn empty_elements() {
        let mut element = DataElement::new("parameters");
        assert!(element.is_empty());

        element.add_element("param");
        assert!(!element.is_empty());

        element.clear();
        assert!(element.is_empty());
        assert_eq!("parameters", element.name());
    }

    #[test]
    fn display() {
        let mut element = DataElement::new("parameters");
        element.add_element("param").add("index", 1).set_text("a");
        element.add_element("param").add("index", 2);

        assert_eq!(
            "parameters[param(index=1)=\"a\", param(index=2)]",
            element.to_string()
        );
    }

    #[test]
    #[cfg(feature = "serde")]
    fn serde_json() {
        let mut element = DataElement::new("param");
        element.add("index", 1).set_text("a");

        assert_eq!(
            r#"{"name":"param","text":"a","attributes":{"index":1}}"#,
            serde_json::to_string(&element).unwrap()
        );
    }
}
