/// Generation tag for the static and dynamic partitions.
///
/// Partitions are named `<prefix>-static-<tag>` and `<prefix>-dynamic-<tag>`;
/// anything else in the store belongs to an older generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionVersion {
  prefix: String,
  tag: String,
}

impl PartitionVersion {
  pub fn new(prefix: impl Into<String>, tag: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      tag: tag.into(),
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn static_partition(&self) -> String {
    format!("{}-static-{}", self.prefix, self.tag)
  }

  pub fn dynamic_partition(&self) -> String {
    format!("{}-dynamic-{}", self.prefix, self.tag)
  }

  /// The older generation owning a static partition name, if any
  pub fn previous_from_static(&self, partition: &str) -> Option<PartitionVersion> {
    let tag = partition.strip_prefix(&format!("{}-static-", self.prefix))?;
    (!tag.is_empty() && tag != self.tag).then(|| PartitionVersion::new(self.prefix.as_str(), tag))
  }

  /// Whether a partition belongs to this generation
  pub fn is_current(&self, partition: &str) -> bool {
    partition == self.static_partition() || partition == self.dynamic_partition()
  }
}
