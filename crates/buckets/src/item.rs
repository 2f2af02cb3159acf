/// A key/value pair copied out of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Item {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

impl<K: Into<Vec<u8>>, V: Into<Vec<u8>>> From<(K, V)> for Item {
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}
