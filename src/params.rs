//! Parsing of the TLB-shootdown command-line parameters.
//!
//! Two words are recognized: `tlbi_max_ops=<n>` bounds the number of
//! page-level invalidations a range flush may issue before it is promoted
//! to a full flush, and `tlbi_method=ipi|sbi` selects how shootdowns reach
//! remote harts. Invalid values are rejected and the default stands;
//! anything else on the command line is left for other subsystems.

use thiserror::Error;

use crate::config::{PAGE_SIZE, PTRS_PER_PTE};

/// How shootdowns are delivered to remote harts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMethod {
	/// Cross-CPU call executing the local invalidation sequence inline.
	Ipi,
	/// The platform's remote-fence firmware call.
	Sbi,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
	#[error("invalid argument")]
	InvalidArgument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbiParams {
	/// Page-vs-full-flush threshold, in pages.
	pub max_ops: usize,
	pub method: FlushMethod,
}

impl Default for TlbiParams {
	fn default() -> Self {
		Self {
			max_ops: 1,
			method: FlushMethod::Sbi,
		}
	}
}

impl TlbiParams {
	pub fn from_cmdline(cmdline: &str) -> Self {
		let mut params = Self::default();
		let words = shell_words::split(cmdline).unwrap_or_default();
		debug!("cli_words = {words:?}");

		for word in &words {
			if let Some(value) = word.strip_prefix("tlbi_max_ops=") {
				match parse_max_ops(value) {
					Ok(max_ops) => params.max_ops = max_ops,
					Err(err) => warn!("tlbi_max_ops={value}: {err}"),
				}
			} else if let Some(value) = word.strip_prefix("tlbi_method=") {
				match parse_method(value) {
					Ok(method) => params.method = method,
					Err(err) => warn!("tlbi_method={value}: {err}"),
				}
			}
		}

		params
	}

	/// The threshold in bytes; ranges larger than this are promoted to a
	/// full address-space flush.
	pub fn threshold(&self) -> usize {
		self.max_ops * PAGE_SIZE
	}
}

/// The value cannot reach `PTRS_PER_PTE`: any non-leaf page-table change
/// needs a full flush anyway.
fn parse_max_ops(value: &str) -> Result<usize, ParamError> {
	let max_ops = value
		.parse::<usize>()
		.map_err(|_| ParamError::InvalidArgument)?;
	if !(1..PTRS_PER_PTE).contains(&max_ops) {
		return Err(ParamError::InvalidArgument);
	}
	Ok(max_ops)
}

fn parse_method(value: &str) -> Result<FlushMethod, ParamError> {
	match value {
		"ipi" => Ok(FlushMethod::Ipi),
		"sbi" => Ok(FlushMethod::Sbi),
		_ => Err(ParamError::InvalidArgument),
	}
}
