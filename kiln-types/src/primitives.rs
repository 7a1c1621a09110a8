/// 32-byte BLAKE3 hash.
pub type Hash = [u8; 32];

/// 20-byte account or contract address.
pub type Address = [u8; 20];

/// 32-byte object identifier.
pub type ObjectId = [u8; 32];

/// Amount of native currency units.
pub type Amount = u64;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Block height (monotonically increasing).
pub type BlockHeight = u64;

/// The zero address. Returned where no address applies (empty call stack,
/// external caller) and never a valid account.
pub const ZERO_ADDRESS: Address = [0u8; 20];

/// The zero hash.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Embed a 20-byte address into the 32-byte object-id namespace by
/// zero-extension. Used for a contract's default object, whose id is the
/// contract's own address.
pub fn object_id_for_address(addr: &Address) -> ObjectId {
    let mut id = [0u8; 32];
    id[..20].copy_from_slice(addr);
    id
}
