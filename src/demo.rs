//! Built-in demo modules for the CLI.
//!
//! Module construction is the driver's job, not the engine's - these are
//! the modules the `cascade` binary knows how to build from the `modules`
//! section of a job file. They are deliberately small: a value producer,
//! two filters, and a JSON-lines output writer.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use cascade_config::Granularity;
use cascade_data::{Principal, RangeSet};
use cascade_module::{
  EventModule, FileBlock, ModuleError, OutputModule, StreamIndex, WriteContext,
};
use serde::Deserialize;

/// Demo-module definitions parsed from the job file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DemoModuleDef {
  /// Puts a fixed JSON value into the principal under `product`.
  Producer {
    product: String,
    value: serde_json::Value,
  },
  /// Accepts events whose `product.field` is at least `min`.
  ThresholdFilter {
    product: String,
    field: String,
    min: f64,
  },
  /// Accepts one event in every `keep_one_in`.
  Prescale { keep_one_in: u64 },
  /// Writes accepted events as JSON lines, one file per generation.
  JsonWriter {
    #[serde(default)]
    file_stem: Option<String>,
    #[serde(default)]
    max_events_per_file: Option<u64>,
    #[serde(default)]
    granularity: Option<Granularity>,
  },
}

pub struct ValueProducer {
  product: String,
  value: serde_json::Value,
}

impl ValueProducer {
  pub fn new(product: String, value: serde_json::Value) -> Self {
    Self { product, value }
  }
}

impl EventModule for ValueProducer {
  fn process_event(&self, principal: &Principal, _stream: StreamIndex) -> Result<bool, ModuleError> {
    principal
      .put(&self.product, self.value.clone())
      .map_err(|e| ModuleError::new("duplicate_product", e.to_string()))?;
    Ok(true)
  }
}

pub struct ThresholdFilter {
  product: String,
  field: String,
  min: f64,
}

impl ThresholdFilter {
  pub fn new(product: String, field: String, min: f64) -> Self {
    Self {
      product,
      field,
      min,
    }
  }
}

impl EventModule for ThresholdFilter {
  fn process_event(&self, principal: &Principal, _stream: StreamIndex) -> Result<bool, ModuleError> {
    let product = principal.get(&self.product).ok_or_else(|| {
      ModuleError::new(
        "product_not_found",
        format!("no product '{}' in {}", self.product, principal.id()),
      )
    })?;
    let value = product
      .get(&self.field)
      .and_then(|v| v.as_f64())
      .ok_or_else(|| {
        ModuleError::new(
          "bad_product",
          format!("product '{}' has no numeric field '{}'", self.product, self.field),
        )
      })?;
    Ok(value >= self.min)
  }
}

pub struct Prescale {
  keep_one_in: u64,
  seen: AtomicU64,
}

impl Prescale {
  pub fn new(keep_one_in: u64) -> Self {
    Self {
      keep_one_in: keep_one_in.max(1),
      seen: AtomicU64::new(0),
    }
  }
}

impl EventModule for Prescale {
  fn process_event(&self, _principal: &Principal, _stream: StreamIndex) -> Result<bool, ModuleError> {
    let n = self.seen.fetch_add(1, Ordering::Relaxed);
    Ok(n % self.keep_one_in == 0)
  }
}

/// JSON-lines output writer.
///
/// Each file generation gets its own `stem_NNN.jsonl`. Run and subrun
/// records arriving while the file is closed (the forced writes during a
/// switch) are buffered and flushed at the next open.
pub struct JsonWriter {
  dir: PathBuf,
  stem: String,
  writer: Mutex<Option<BufWriter<File>>>,
  buffered: Mutex<Vec<serde_json::Value>>,
  events_in_file: AtomicUsize,
  events_total: AtomicUsize,
  max_events_per_file: Option<u64>,
  granularity: Granularity,
}

impl JsonWriter {
  pub fn new(
    dir: PathBuf,
    stem: String,
    max_events_per_file: Option<u64>,
    granularity: Granularity,
  ) -> Self {
    Self {
      dir,
      stem,
      writer: Mutex::new(None),
      buffered: Mutex::new(Vec::new()),
      events_in_file: AtomicUsize::new(0),
      events_total: AtomicUsize::new(0),
      max_events_per_file,
      granularity,
    }
  }

  pub fn events_total(&self) -> usize {
    self.events_total.load(Ordering::Relaxed)
  }

  fn write_line(&self, record: serde_json::Value) -> Result<(), ModuleError> {
    let mut guard = self.writer.lock().expect("writer poisoned");
    match guard.as_mut() {
      Some(writer) => {
        serde_json::to_writer(&mut *writer, &record)
          .and_then(|_| writer.write_all(b"\n").map_err(serde_json::Error::io))
          .map_err(|e| ModuleError::new("io", e.to_string()))
      }
      None => {
        // File is mid-switch; hold the record for the next generation.
        self.buffered.lock().expect("buffer poisoned").push(record);
        Ok(())
      }
    }
  }
}

impl EventModule for JsonWriter {
  fn process_event(&self, _principal: &Principal, _stream: StreamIndex) -> Result<bool, ModuleError> {
    // Observation happens on the end path; the write comes separately.
    Ok(true)
  }
}

impl OutputModule for JsonWriter {
  fn open_file(&self, block: &FileBlock) -> Result<(), ModuleError> {
    let path = self
      .dir
      .join(format!("{}_{:03}.jsonl", self.stem, block.sequence));
    let file = File::create(&path)
      .map_err(|e| ModuleError::new("io", format!("create {}: {}", path.display(), e)))?;
    let mut writer = BufWriter::new(file);
    for record in self.buffered.lock().expect("buffer poisoned").drain(..) {
      serde_json::to_writer(&mut writer, &record)
        .and_then(|_| writer.write_all(b"\n").map_err(serde_json::Error::io))
        .map_err(|e| ModuleError::new("io", e.to_string()))?;
    }
    *self.writer.lock().expect("writer poisoned") = Some(writer);
    self.events_in_file.store(0, Ordering::Relaxed);
    Ok(())
  }

  fn close_file(&self) -> Result<(), ModuleError> {
    if let Some(mut writer) = self.writer.lock().expect("writer poisoned").take() {
      writer
        .flush()
        .map_err(|e| ModuleError::new("io", e.to_string()))?;
    }
    Ok(())
  }

  fn is_file_open(&self) -> bool {
    self.writer.lock().expect("writer poisoned").is_some()
  }

  fn write_event(&self, principal: &Principal, ctx: &WriteContext) -> Result<(), ModuleError> {
    let id = principal.id();
    self.write_line(serde_json::json!({
      "type": "event",
      "run": id.run,
      "subrun": id.subrun,
      "event": id.event,
      "path": ctx.path,
      "module": ctx.label,
      "products": principal.products(),
    }))?;
    self.events_in_file.fetch_add(1, Ordering::Relaxed);
    self.events_total.fetch_add(1, Ordering::Relaxed);
    Ok(())
  }

  fn write_run(&self, run: u32, ranges: &RangeSet) -> Result<(), ModuleError> {
    self.write_line(serde_json::json!({
      "type": "run",
      "run": run,
      "ranges": ranges,
    }))
  }

  fn write_subrun(&self, run: u32, subrun: u32, ranges: &RangeSet) -> Result<(), ModuleError> {
    self.write_line(serde_json::json!({
      "type": "subrun",
      "run": run,
      "subrun": subrun,
      "ranges": ranges,
    }))
  }

  fn requests_to_close(&self) -> bool {
    self
      .max_events_per_file
      .is_some_and(|max| self.events_in_file.load(Ordering::Relaxed) as u64 >= max)
  }

  fn limit_reached(&self) -> bool {
    false
  }

  fn granularity(&self) -> Granularity {
    self.granularity
  }
}

/// Build the module set for a job file's `modules` section.
pub fn build_modules(
  defs: &HashMap<String, DemoModuleDef>,
  data_dir: &std::path::Path,
) -> cascade_engine::ModuleSet {
  use cascade_engine::ModuleSet;
  use cascade_module::ModuleHandle;
  use std::sync::Arc;

  let mut modules = ModuleSet::new();
  for (label, def) in defs {
    match def.clone() {
      DemoModuleDef::Producer { product, value } => {
        modules.register_replicated(label.clone(), move |_| {
          ModuleHandle::Plain(Arc::new(ValueProducer::new(product.clone(), value.clone())))
        });
      }
      DemoModuleDef::ThresholdFilter {
        product,
        field,
        min,
      } => {
        modules.register_replicated(label.clone(), move |_| {
          ModuleHandle::Plain(Arc::new(ThresholdFilter::new(
            product.clone(),
            field.clone(),
            min,
          )))
        });
      }
      DemoModuleDef::Prescale { keep_one_in } => {
        // One shared instance so the prescale counts across streams.
        modules.register_shared(
          label.clone(),
          ModuleHandle::Plain(Arc::new(Prescale::new(keep_one_in))),
        );
      }
      DemoModuleDef::JsonWriter {
        file_stem,
        max_events_per_file,
        granularity,
      } => {
        let writer = JsonWriter::new(
          data_dir.to_path_buf(),
          file_stem.unwrap_or_else(|| label.clone()),
          max_events_per_file,
          granularity.unwrap_or(Granularity::Event),
        );
        modules.register_shared(label.clone(), ModuleHandle::Output(Arc::new(writer)));
      }
    }
  }
  modules
}

#[cfg(test)]
mod tests {
  use super::*;
  use cascade_data::EventId;

  fn principal(event: u64) -> Principal {
    Principal::new(EventId::new(1, 1, event))
  }

  #[test]
  fn producer_puts_its_product() {
    let producer = ValueProducer::new("calib".into(), serde_json::json!({ "gain": 2.0 }));
    let p = principal(1);
    assert!(producer.process_event(&p, 0).unwrap());
    assert_eq!(p.get("calib"), Some(serde_json::json!({ "gain": 2.0 })));
  }

  #[test]
  fn threshold_filter_cuts_below_min() {
    let filter = ThresholdFilter::new("raw".into(), "energy".into(), 50.0);
    let low = principal(1);
    low.put("raw", serde_json::json!({ "energy": 10.0 })).unwrap();
    assert!(!filter.process_event(&low, 0).unwrap());

    let high = principal(2);
    high.put("raw", serde_json::json!({ "energy": 90.0 })).unwrap();
    assert!(filter.process_event(&high, 0).unwrap());
  }

  #[test]
  fn threshold_filter_reports_missing_products() {
    let filter = ThresholdFilter::new("raw".into(), "energy".into(), 50.0);
    let err = filter.process_event(&principal(1), 0).unwrap_err();
    assert_eq!(err.category(), "product_not_found");
  }

  #[test]
  fn prescale_keeps_one_in_n() {
    let prescale = Prescale::new(3);
    let kept: Vec<bool> = (1..=6)
      .map(|e| prescale.process_event(&principal(e), 0).unwrap())
      .collect();
    assert_eq!(kept, vec![true, false, false, true, false, false]);
  }

  #[test]
  fn json_writer_switches_files_and_keeps_buffered_records() {
    let dir = tempfile::tempdir().unwrap();
    let writer = JsonWriter::new(dir.path().to_path_buf(), "out".into(), Some(1), Granularity::Event);

    writer.open_file(&FileBlock::first()).unwrap();
    let p = principal(1);
    writer
      .write_event(&p, &WriteContext::new("end", "writer"))
      .unwrap();
    assert!(writer.requests_to_close());

    writer.close_file().unwrap();
    assert!(!writer.is_file_open());

    // Records arriving while closed are held for the next generation.
    let ranges = RangeSet::for_run(1);
    writer.write_subrun(1, 1, &ranges).unwrap();

    writer.open_file(&FileBlock::first().next()).unwrap();
    writer.close_file().unwrap();

    let first = std::fs::read_to_string(dir.path().join("out_000.jsonl")).unwrap();
    assert!(first.contains("\"event\""));
    let second = std::fs::read_to_string(dir.path().join("out_001.jsonl")).unwrap();
    assert!(second.contains("\"subrun\""));
    assert_eq!(writer.events_total(), 1);
  }
}
