//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelError {
	InvalidConfig,
	InvalidArchitecture,
	InvalidInput,
	UnknownModel,
	UnknownEmbedMode,
	NonFiniteLoss,
	Torch,
	IOError,
	Checkpoint,
	ConfigParse,
}

impl From<tch::TchError> for ErrPack<ModelError> {
	#[cold]
	#[inline(never)]
	fn from(err: tch::TchError) -> Self {
		Self {
			code: ModelError::Torch,
			extra: Some(Box::new(ErrExtra {
				message: "torch operation failed".into(),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

impl From<std::io::Error> for ErrPack<ModelError> {
	#[cold]
	#[inline(never)]
	fn from(err: std::io::Error) -> Self {
		Self {
			code: ModelError::IOError,
			extra: Some(Box::new(ErrExtra { message: "".into(), nested: Some(Box::new(err)) })),
		}
	}
}

impl From<safetensors::SafeTensorError> for ErrPack<ModelError> {
	#[cold]
	#[inline(never)]
	fn from(err: safetensors::SafeTensorError) -> Self {
		Self {
			code: ModelError::Checkpoint,
			extra: Some(Box::new(ErrExtra {
				message: format!("safetensors: {err}").into(),
				nested: None,
			})),
		}
	}
}

impl From<toml::de::Error> for ErrPack<ModelError> {
	#[cold]
	#[inline(never)]
	fn from(err: toml::de::Error) -> Self {
		Self::nested(ModelError::ConfigParse, "cannot parse TOML", err)
	}
}

impl From<toml::ser::Error> for ErrPack<ModelError> {
	#[cold]
	#[inline(never)]
	fn from(err: toml::ser::Error) -> Self {
		Self::nested(ModelError::ConfigParse, "cannot serialize TOML", err)
	}
}

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
pub fn invalid_config(message: impl Into<std::borrow::Cow<'static, str>>) -> ErrPack<ModelError> {
	ErrPack::new(ModelError::InvalidConfig, message)
}

#[cold]
#[inline(never)]
pub fn invalid_input(message: impl Into<std::borrow::Cow<'static, str>>) -> ErrPack<ModelError> {
	ErrPack::new(ModelError::InvalidInput, message)
}

#[cold]
#[inline(never)]
pub fn checkpoint_error(
	message: impl Into<std::borrow::Cow<'static, str>>,
) -> ErrPack<ModelError> {
	ErrPack::new(ModelError::Checkpoint, message)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_display_includes_code_and_message() {
		let err = invalid_config("latent_size must be positive");
		let text = err.to_string();
		assert!(text.contains("InvalidConfig"));
		assert!(text.contains("latent_size must be positive"));
		assert_eq!(err.message(), "latent_size must be positive");
	}

	#[test]
	fn test_io_error_is_nested() {
		let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.safetensors");
		let err: ErrPack<ModelError> = io.into();
		assert_eq!(err.code, ModelError::IOError);
		assert!(err.to_string().contains("missing.safetensors"));
	}
}
