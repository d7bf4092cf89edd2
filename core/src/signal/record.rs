use crate::signal::SignalError;

/// Persisted session state: opaque bytes to the store, structured to the
/// cipher.
pub trait Record: Sized {
    fn serialize(&self) -> Result<Vec<u8>, SignalError>;
    fn deserialize(data: &[u8]) -> Result<Self, SignalError>;
}

macro_rules! impl_json_record {
    ($ty:ty) => {
        impl $crate::signal::Record for $ty {
            fn serialize(&self) -> Result<Vec<u8>, $crate::signal::SignalError> {
                Ok(serde_json::to_vec(self)?)
            }

            fn deserialize(data: &[u8]) -> Result<Self, $crate::signal::SignalError> {
                Ok(serde_json::from_slice(data)?)
            }
        }
    };
}

pub(crate) use impl_json_record;
