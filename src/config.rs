use crate::error::{Error, Result};

/// Default upper bound on a single frame, header included
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default upper bound on handles attached to one message
pub const DEFAULT_MAX_HANDLES: usize = 64;

/// Default number of bytes requested per read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Limits and tuning for a [`Channel`](crate::Channel)
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    max_message_size: usize,
    max_handles: usize,
    read_chunk_size: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_handles: DEFAULT_MAX_HANDLES,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl ChannelOptions {
    /// Create a new builder for ChannelOptions
    pub fn builder() -> ChannelOptionsBuilder {
        ChannelOptionsBuilder::default()
    }

    /// Largest frame accepted in either direction
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Largest number of handles accepted on one message
    ///
    /// The kernel bounds descriptors per `sendmsg` as well (253 on Linux),
    /// so this is a backend limit rather than a wire-format one.
    pub fn max_handles(&self) -> usize {
        self.max_handles
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }
}

/// Builder for ChannelOptions
#[derive(Debug, Default)]
pub struct ChannelOptionsBuilder {
    inner: ChannelOptions,
}

impl ChannelOptionsBuilder {
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.inner.max_message_size = bytes;
        self
    }

    pub fn max_handles(mut self, count: usize) -> Self {
        self.inner.max_handles = count;
        self
    }

    pub fn read_chunk_size(mut self, bytes: usize) -> Self {
        self.inner.read_chunk_size = bytes;
        self
    }

    pub fn build(self) -> Result<ChannelOptions> {
        let options = self.inner;
        if options.max_message_size < crate::message::HEADER_SIZE {
            return Err(Error::Config(format!(
                "max_message_size {} is smaller than a message header",
                options.max_message_size
            )));
        }
        if options.max_message_size > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_message_size {} does not fit the 32-bit length field",
                options.max_message_size
            )));
        }
        if options.read_chunk_size == 0 {
            return Err(Error::Config("read_chunk_size must be non-zero".to_string()));
        }
        Ok(options)
    }
}

/// Limits for an [`EndpointRegistry`](crate::EndpointRegistry)
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    max_endpoint_id: u32,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_endpoint_id: u32::MAX,
        }
    }
}

impl RegistryOptions {
    /// Create a new builder for RegistryOptions
    pub fn builder() -> RegistryOptionsBuilder {
        RegistryOptionsBuilder::default()
    }

    /// Highest local identifier handed out; identifiers start at 1
    pub fn max_endpoint_id(&self) -> u32 {
        self.max_endpoint_id
    }
}

/// Builder for RegistryOptions
#[derive(Debug, Default)]
pub struct RegistryOptionsBuilder {
    inner: RegistryOptions,
}

impl RegistryOptionsBuilder {
    pub fn max_endpoint_id(mut self, id: u32) -> Self {
        self.inner.max_endpoint_id = id;
        self
    }

    pub fn build(self) -> Result<RegistryOptions> {
        if self.inner.max_endpoint_id == 0 {
            return Err(Error::Config(
                "max_endpoint_id must leave room for the bootstrap endpoint".to_string(),
            ));
        }
        Ok(self.inner)
    }
}

/// Configuration for an [`IpcSupport`](crate::IpcSupport) context
#[derive(Debug, Clone)]
pub struct SupportOptions {
    channel: ChannelOptions,
    registry: RegistryOptions,
    io_thread_name: String,
}

impl Default for SupportOptions {
    fn default() -> Self {
        Self {
            channel: ChannelOptions::default(),
            registry: RegistryOptions::default(),
            io_thread_name: "tether-io".to_string(),
        }
    }
}

impl SupportOptions {
    /// Create a new builder for SupportOptions
    pub fn builder() -> SupportOptionsBuilder {
        SupportOptionsBuilder::default()
    }

    pub fn channel(&self) -> &ChannelOptions {
        &self.channel
    }

    pub fn registry(&self) -> &RegistryOptions {
        &self.registry
    }

    pub fn io_thread_name(&self) -> &str {
        &self.io_thread_name
    }
}

/// Builder for SupportOptions
#[derive(Debug, Default)]
pub struct SupportOptionsBuilder {
    inner: SupportOptions,
}

impl SupportOptionsBuilder {
    pub fn channel(mut self, options: ChannelOptions) -> Self {
        self.inner.channel = options;
        self
    }

    pub fn registry(mut self, options: RegistryOptions) -> Self {
        self.inner.registry = options;
        self
    }

    pub fn io_thread_name(mut self, name: impl Into<String>) -> Self {
        self.inner.io_thread_name = name.into();
        self
    }

    pub fn build(self) -> SupportOptions {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_defaults() {
        let options = ChannelOptions::default();
        assert_eq!(options.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(options.max_handles(), DEFAULT_MAX_HANDLES);
        assert_eq!(options.read_chunk_size(), DEFAULT_READ_CHUNK_SIZE);
    }

    #[test]
    fn test_channel_builder() {
        let options = ChannelOptions::builder()
            .max_message_size(1024)
            .max_handles(4)
            .read_chunk_size(1)
            .build()
            .unwrap();
        assert_eq!(options.max_message_size(), 1024);
        assert_eq!(options.max_handles(), 4);
        assert_eq!(options.read_chunk_size(), 1);
    }

    #[test]
    fn test_channel_builder_rejects_tiny_limit() {
        let result = ChannelOptions::builder().max_message_size(8).build();
        assert!(matches!(result, Err(Error::Config(_))));

        let result = ChannelOptions::builder().read_chunk_size(0).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_registry_builder_rejects_zero() {
        assert!(RegistryOptions::builder().max_endpoint_id(0).build().is_err());
        assert_eq!(
            RegistryOptions::builder()
                .max_endpoint_id(8)
                .build()
                .unwrap()
                .max_endpoint_id(),
            8
        );
    }

    #[test]
    fn test_support_builder() {
        let options = SupportOptions::builder().io_thread_name("io-test").build();
        assert_eq!(options.io_thread_name(), "io-test");
        assert_eq!(options.registry().max_endpoint_id(), u32::MAX);
    }
}
