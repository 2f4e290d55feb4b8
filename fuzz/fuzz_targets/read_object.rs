#![no_main]

use libfuzzer_sys::fuzz_target;
use quiver_db::buffer::{Buffer, HeapBuffer};
use quiver_db::object::ObjectReader;

fuzz_target!(|data: &[u8]| {
    let mut buf = HeapBuffer::new(data.len());
    if let Some(bytes) = buf.bytes_mut() {
        bytes.copy_from_slice(data);
    }
    let Ok(reader) = ObjectReader::new(buf) else {
        return;
    };

    if let Ok(Some(vector)) = reader.vector() {
        assert!(vector.len() * 4 <= data.len());
    }
    for offset in [16, data.len() / 2, data.len().saturating_sub(4)] {
        let _ = reader.string_at(offset);
    }
    if let Ok(Some(vector)) = reader.into_vector() {
        assert_eq!(vector.buffer().len(), vector.len() * 4);
    }
});
