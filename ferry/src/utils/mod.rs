pub mod address;
pub mod buf_pool;

/// Create a zero-initialized Vec without paying for element-by-element pushes.
pub fn allocate_vec(len: usize) -> Vec<u8> {
    vec![0u8; len]
}
