use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use bytes::{Bytes, BytesMut};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128 keys are always 16 raw bytes on the wire.
pub const KEY_SIZE: usize = 16;

const BLOCK_SIZE: usize = 16;

/// A list of possible errors while setting up or running segment decryption.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
	#[error("failed to download key")]
	KeyFetch,

	#[error("AES-128 key must be {KEY_SIZE} bytes, got {0}")]
	KeySize(usize),

	#[error("invalid IV `{0}`")]
	InvalidIv(String),

	#[error("unsupported encryption method")]
	UnsupportedMethod,

	#[error("ciphertext is not a multiple of the cipher block size")]
	Truncated,

	#[error("invalid PKCS#7 padding")]
	Padding,
}

/// Derive the 16-byte IV for a segment.
///
/// When the playlist carries an IV attribute it is hex (optionally
/// `0x`-prefixed), right-aligned in 16 bytes and zero-padded on the left.
/// Otherwise the IV is 12 zero bytes followed by the big-endian 32-bit
/// segment sequence number.
pub fn derive_iv(iv: Option<&str>, sequence: u64) -> Result<[u8; 16], CryptoError> {
	let mut out = [0u8; 16];

	let Some(iv) = iv else {
		out[12..].copy_from_slice(&(sequence as u32).to_be_bytes());
		return Ok(out);
	};

	let hex = iv.strip_prefix("0x").unwrap_or(iv);
	let invalid = || CryptoError::InvalidIv(iv.to_string());

	// right-align odd-length hex by prepending a zero nibble
	let padded;
	let hex = if hex.len() % 2 == 1 {
		padded = format!("0{hex}");
		&padded
	} else {
		hex
	};

	let bytes = hex::decode(hex).map_err(|_| invalid())?;
	if bytes.is_empty() || bytes.len() > 16 {
		return Err(invalid());
	}

	out[16 - bytes.len()..].copy_from_slice(&bytes);
	Ok(out)
}

/// Streaming AES-128-CBC decryption of one segment.
///
/// [Self::update] always withholds the final ciphertext block, since it may
/// carry the padding; [Self::finalize] decrypts it and strips the PKCS#7
/// padding at segment end.
pub struct SegmentDecryptor {
	cipher: Aes128CbcDec,
	pending: BytesMut,
}

impl SegmentDecryptor {
	pub fn new(key: &[u8], iv: &[u8; 16]) -> Result<Self, CryptoError> {
		let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::KeySize(key.len()))?;
		Ok(Self {
			cipher,
			pending: BytesMut::new(),
		})
	}

	/// Decrypt as much of the segment as possible.
	///
	/// The output may be shorter than the input; the remainder is buffered
	/// until the next call or [Self::finalize].
	pub fn update(&mut self, chunk: &[u8]) -> Bytes {
		self.pending.extend_from_slice(chunk);

		let len = self.pending.len();
		if len <= BLOCK_SIZE {
			return Bytes::new();
		}

		// decrypt all complete blocks but one
		let usable = (len - 1) / BLOCK_SIZE * BLOCK_SIZE;
		let mut out = self.pending.split_to(usable);
		for block in out.chunks_mut(BLOCK_SIZE) {
			self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
		}

		out.freeze()
	}

	/// Decrypt the withheld block and strip the PKCS#7 padding.
	///
	/// Returns the residual plaintext, which may be empty when the segment
	/// ended exactly on a block boundary.
	pub fn finalize(mut self) -> Result<Bytes, CryptoError> {
		if self.pending.is_empty() {
			return Ok(Bytes::new());
		}

		if self.pending.len() != BLOCK_SIZE {
			return Err(CryptoError::Truncated);
		}

		let mut block = self.pending.split_to(BLOCK_SIZE);
		self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(&mut block));

		let pad = block[BLOCK_SIZE - 1] as usize;
		if pad == 0 || pad > BLOCK_SIZE {
			return Err(CryptoError::Padding);
		}
		if !block[BLOCK_SIZE - pad..].iter().all(|byte| *byte as usize == pad) {
			return Err(CryptoError::Padding);
		}

		block.truncate(BLOCK_SIZE - pad);
		Ok(block.freeze())
	}
}
