use binrw::BinRead;
use std::fmt;

/// Fixed-size byte blob that prints as an uppercase hexstring.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, BinRead)]
pub struct HexData<const N: usize>(pub [u8; N]);

impl<const N: usize> HexData<N> {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl<const N: usize> Default for HexData<N> {
    fn default() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> fmt::Debug for HexData<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl<const N: usize> fmt::Display for HexData<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<'de, const N: usize> serde::Deserialize<'de> for HexData<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct StrVisitor<const N: usize>;
        impl<'de, const N: usize> serde::de::Visitor<'de> for StrVisitor<N> {
            type Value = HexData<N>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a hexstring of {} bytes", N)
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if s.len() != N * 2 {
                    return Err(E::invalid_length(s.len(), &self));
                }
                let mut value = [0; N];
                hex::decode_to_slice(s, &mut value)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(s), &self))?;
                Ok(HexData(value))
            }
        }

        deserializer.deserialize_str(StrVisitor)
    }
}

impl<const N: usize> serde::Serialize for HexData<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<const N: usize> AsRef<[u8]> for HexData<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> From<[u8; N]> for HexData<N> {
    fn from(value: [u8; N]) -> Self {
        Self(value)
    }
}

impl<const N: usize> From<HexData<N>> for [u8; N] {
    fn from(value: HexData<N>) -> Self {
        value.0
    }
}
