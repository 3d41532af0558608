use crate::config::BrokerConfig;
use crate::error::{BrokerUnitError, Result};
use crate::types::*;
use dashmap::DashMap;

/// Outcome of a produce, including whether the topic was created on the fly.
#[derive(Debug, Clone)]
pub struct ProduceOutcome {
    pub base_offset: Offset,
    pub auto_created: Option<TopicInfo>,
}

/// One in-memory log segment. A segment is closed once appending would push it
/// past the configured segment size, matching the roll-by-bytes behavior of the
/// broker this harness stands in for.
#[derive(Debug, Default)]
struct Segment {
    records: Vec<StoredRecord>,
    bytes: u64,
}

#[derive(Debug)]
struct PartitionLog {
    segments: Vec<Segment>,
    next_offset: Offset,
    segment_bytes: u64,
}

impl PartitionLog {
    fn new(segment_bytes: u64) -> Self {
        Self {
            segments: vec![Segment::default()],
            next_offset: 0,
            segment_bytes,
        }
    }

    fn append(&mut self, record: Record) -> Offset {
        let offset = self.next_offset;
        let stored = StoredRecord {
            offset,
            crc32: record_crc32(&record),
            record,
        };
        let size = stored.size() as u64;

        let current = self.segments.last_mut().unwrap();
        if !current.records.is_empty() && current.bytes + size > self.segment_bytes {
            self.segments.push(Segment::default());
        }
        let current = self.segments.last_mut().unwrap();
        current.bytes += size;
        current.records.push(stored);

        self.next_offset = offset + 1;
        offset
    }

    fn fetch(&self, fetch_offset: Offset, max_records: usize) -> Result<Vec<StoredRecord>> {
        let mut out = Vec::new();
        for segment in &self.segments {
            for stored in &segment.records {
                if stored.offset < fetch_offset {
                    continue;
                }
                if out.len() >= max_records {
                    return Ok(out);
                }
                if record_crc32(&stored.record) != stored.crc32 {
                    return Err(BrokerUnitError::ChecksumMismatch(stored.offset));
                }
                out.push(stored.clone());
            }
        }
        Ok(out)
    }

    fn high_watermark(&self) -> Offset {
        self.next_offset
    }

    fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

fn record_crc32(record: &Record) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    if let Some(key) = &record.key {
        hasher.update(key);
    }
    hasher.update(&record.value);
    hasher.finalize()
}

/// The broker's data plane state: topics and their in-memory partition logs.
pub struct BrokerCore {
    config: BrokerConfig,
    topics: DashMap<TopicName, TopicInfo>,
    partitions: DashMap<TopicPartition, parking_lot::Mutex<PartitionLog>>,
}

impl BrokerCore {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            topics: DashMap::new(),
            partitions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn create_topic(&self, name: &str, partitions: u32) -> Result<TopicInfo> {
        if partitions == 0 {
            return Err(BrokerUnitError::InvalidOperation(
                "topic must have at least one partition".to_string(),
            ));
        }
        if self.topics.contains_key(name) {
            return Err(BrokerUnitError::TopicAlreadyExists(name.to_string()));
        }

        let info = TopicInfo {
            name: name.to_string(),
            partitions,
            created_at: chrono::Utc::now(),
        };
        for partition in 0..partitions {
            self.partitions.insert(
                TopicPartition {
                    topic: name.to_string(),
                    partition,
                },
                parking_lot::Mutex::new(PartitionLog::new(self.config.segment_bytes)),
            );
        }
        self.topics.insert(name.to_string(), info.clone());
        Ok(info)
    }

    pub fn topic(&self, name: &str) -> Option<TopicInfo> {
        self.topics.get(name).map(|entry| entry.value().clone())
    }

    pub fn topics(&self) -> Vec<TopicInfo> {
        self.topics.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn produce(
        &self,
        topic: &str,
        partition: Option<PartitionId>,
        records: Vec<Record>,
    ) -> Result<ProduceOutcome> {
        for record in &records {
            let size = record.value.len() + record.key.as_ref().map_or(0, |k| k.len());
            if size > self.config.max_message_bytes {
                return Err(BrokerUnitError::MessageTooLarge {
                    size,
                    max: self.config.max_message_bytes,
                });
            }
        }

        let auto_created = if self.topics.contains_key(topic) {
            None
        } else if self.config.auto_create_topics {
            match self.create_topic(topic, self.config.default_partitions) {
                Ok(info) => Some(info),
                // Lost a creation race with another producer; the topic exists now.
                Err(BrokerUnitError::TopicAlreadyExists(_)) => None,
                Err(e) => return Err(e),
            }
        } else {
            return Err(BrokerUnitError::TopicNotFound(topic.to_string()));
        };

        let partition = partition.unwrap_or(0);
        let tp = TopicPartition {
            topic: topic.to_string(),
            partition,
        };
        let log = self
            .partitions
            .get(&tp)
            .ok_or(BrokerUnitError::PartitionNotFound(partition))?;

        let mut log = log.lock();
        let base_offset = log.high_watermark();
        for record in records {
            log.append(record);
        }

        Ok(ProduceOutcome {
            base_offset,
            auto_created,
        })
    }

    pub fn fetch(
        &self,
        topic: &str,
        partition: PartitionId,
        fetch_offset: Offset,
        max_records: usize,
    ) -> Result<(Vec<StoredRecord>, Offset)> {
        if !self.topics.contains_key(topic) {
            return Err(BrokerUnitError::TopicNotFound(topic.to_string()));
        }
        let tp = TopicPartition {
            topic: topic.to_string(),
            partition,
        };
        let log = self
            .partitions
            .get(&tp)
            .ok_or(BrokerUnitError::PartitionNotFound(partition))?;
        let log = log.lock();
        let records = log.fetch(fetch_offset, max_records)?;
        Ok((records, log.high_watermark()))
    }

    pub fn segment_count(&self, topic: &str, partition: PartitionId) -> Result<usize> {
        let tp = TopicPartition {
            topic: topic.to_string(),
            partition,
        };
        let log = self
            .partitions
            .get(&tp)
            .ok_or_else(|| BrokerUnitError::TopicNotFound(topic.to_string()))?;
        let count = log.lock().segment_count();
        Ok(count)
    }
}
