//! Order-preserving binary encoding for datom values and composite keys.

mod codec;

pub use codec::{
    compare_encoded, decode, encode, encode_into, encoded_len, encoded_size,
};
