use crate::error::ResolveError;
use ahash::HashMap;
use ahash::HashMapExt;
use sortbench_types::BackendKind;
use sortbench_types::Combine;
use sortbench_types::Knob;
use sortbench_types::RunConfig;
use sortbench_types::SweepParam;
use sortbench_types::SweepPlan;
use std::path::Path;
use std::path::PathBuf;

/// Values from the environment or command line. Applied over the plan file, which is applied over built-in defaults.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
  pub threads: Option<String>,
  pub memory_limit: Option<String>,
  pub temp_dir: Option<PathBuf>,
  pub timeout_secs: Option<u64>,
  pub cooldown_secs: Option<u64>,
  pub location: Option<String>,
}

impl Overrides {
  pub fn apply(&self, plan: &mut SweepPlan) {
    if let Some(threads) = &self.threads {
      plan.defaults.threads = Knob(threads.clone());
    }
    if let Some(memory_limit) = &self.memory_limit {
      plan.defaults.memory_limit = Knob(memory_limit.clone());
    }
    if let Some(temp_dir) = &self.temp_dir {
      plan.defaults.temp_dir = Some(temp_dir.clone());
    }
    if let Some(timeout_secs) = self.timeout_secs {
      plan.timeout_secs = timeout_secs;
    }
    if let Some(cooldown_secs) = self.cooldown_secs {
      plan.cooldown_secs = cooldown_secs;
    }
    if let Some(location) = &self.location {
      plan.dataset.location = location.clone();
    }
  }
}

/// Makes the plan's relative paths relative to `base`, the sweep folder. A DuckDB location is a file, so it is treated as a path too.
pub fn resolve_plan_paths(plan: &mut SweepPlan, base: &Path) {
  let rebase = |path: &mut PathBuf| {
    if path.is_relative() {
      *path = base.join(&*path);
    }
  };
  rebase(&mut plan.dataset.input);
  if let Some(work_dir) = plan.work_dir.as_mut() {
    rebase(work_dir);
  }
  if let Some(script) = plan.postgres.cache_reset_script.as_mut() {
    rebase(script);
  }
  if plan.backend == BackendKind::DuckDb {
    let mut location = PathBuf::from(&plan.dataset.location);
    rebase(&mut location);
    plan.dataset.location = location.to_string_lossy().into_owned();
  }
}

/// Turns a plan into its sweep points. Points are produced on demand in axis order, and iterating again always yields the same sequence.
#[derive(Clone, Debug)]
pub struct Resolver {
  sweep: String,
  plan: SweepPlan,
  work_dir: PathBuf,
  template: Option<String>,
  // Position in the full axis expansion of each point.
  positions: Vec<usize>,
}

impl Resolver {
  /// `default_work_dir` is used when the plan doesn't set `work_dir`. Fails if the plan has empty values, two points would share an artifact path, or reclaiming an artifact would delete the dataset or the work directory.
  pub fn new(
    sweep: impl Into<String>,
    mut plan: SweepPlan,
    overrides: &Overrides,
    default_work_dir: &Path,
  ) -> Result<Self, ResolveError> {
    overrides.apply(&mut plan);

    if plan.defaults.threads.as_str().trim().is_empty() {
      return Err(ResolveError::EmptyDefault {
        param: SweepParam::Threads,
      });
    }
    if plan.defaults.memory_limit.as_str().trim().is_empty() {
      return Err(ResolveError::EmptyDefault {
        param: SweepParam::MemoryLimit,
      });
    }
    for axis in &plan.axes {
      if axis.values.is_empty() {
        return Err(ResolveError::EmptyAxis { param: axis.param });
      }
      if let Some(index) = axis.values.iter().position(|v| v.as_str().trim().is_empty()) {
        return Err(ResolveError::EmptyValue {
          param: axis.param,
          index,
        });
      }
    }

    let template = plan
      .defaults
      .output
      .clone()
      .or_else(|| plan.backend.default_output_template().map(str::to_string));
    let work_dir = plan
      .work_dir
      .clone()
      .unwrap_or_else(|| default_work_dir.to_path_buf());

    let mut resolver = Self {
      sweep: sweep.into(),
      plan,
      work_dir,
      template,
      positions: Vec::new(),
    };
    resolver.positions = resolver.distinct_positions();
    resolver.check_artifacts_unique()?;
    let mut protected = vec![
      resolver.plan.dataset.input.clone(),
      resolver.work_dir.clone(),
    ];
    if resolver.plan.backend == BackendKind::DuckDb {
      protected.push(PathBuf::from(&resolver.plan.dataset.location));
    }
    for path in &protected {
      resolver.check_protected(path)?;
    }
    Ok(resolver)
  }

  pub fn sweep(&self) -> &str {
    &self.sweep
  }

  pub fn plan(&self) -> &SweepPlan {
    &self.plan
  }

  pub fn work_dir(&self) -> &Path {
    &self.work_dir
  }

  pub fn len(&self) -> usize {
    self.positions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn points(&self) -> impl Iterator<Item = RunConfig> + '_ {
    (0..self.len()).map(move |i| self.point(i))
  }

  /// Panics if `index >= self.len()`.
  pub fn point(&self, index: usize) -> RunConfig {
    // Construction has already validated every template, so rendering can't fail here.
    self
      .try_point(index)
      .unwrap_or_else(|err| panic!("point {index} failed to resolve after validation: {err}"))
  }

  /// Fails if some point's artifact is `path` or one of its ancestors, as reclaiming that artifact would delete `path`.
  pub fn check_protected(&self, path: &Path) -> Result<(), ResolveError> {
    let protected = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    for index in 0..self.len() {
      let Some(artifact) = self.try_point(index)?.output else {
        continue;
      };
      let artifact_abs = std::path::absolute(&artifact).unwrap_or_else(|_| artifact.clone());
      if protected.starts_with(&artifact_abs) {
        return Err(ResolveError::ArtifactOverlap {
          point: index,
          artifact,
          protected: path.to_path_buf(),
        });
      }
    }
    Ok(())
  }

  fn expansion_len(&self) -> usize {
    let axes = &self.plan.axes;
    if axes.is_empty() {
      return 1;
    }
    match self.plan.combine {
      Combine::Vary => axes.iter().map(|a| a.values.len()).sum(),
      Combine::Product => axes.iter().map(|a| a.values.len()).product(),
    }
  }

  // In Vary mode every axis runs through the other knobs' defaults, so a value equal to its own default repeats a point an earlier axis already produced. Repeats within one axis are kept.
  fn distinct_positions(&self) -> Vec<usize> {
    if self.plan.combine == Combine::Product || self.plan.axes.is_empty() {
      return (0..self.expansion_len()).collect();
    }
    let mut first_axis = HashMap::<(&str, &str), usize>::new();
    let mut out = Vec::new();
    let mut position = 0;
    for (axis_index, axis) in self.plan.axes.iter().enumerate() {
      for _ in &axis.values {
        let axis_of_first = *first_axis.entry(self.knobs(position)).or_insert(axis_index);
        if axis_of_first == axis_index {
          out.push(position);
        }
        position += 1;
      }
    }
    out
  }

  fn assignments(&self, position: usize) -> Vec<(SweepParam, &Knob)> {
    let axes = &self.plan.axes;
    assert!(
      position < self.expansion_len(),
      "position {position} out of range"
    );
    match self.plan.combine {
      Combine::Vary => {
        let mut rem = position;
        for axis in axes {
          if rem < axis.values.len() {
            return vec![(axis.param, &axis.values[rem])];
          }
          rem -= axis.values.len();
        }
        vec![]
      }
      Combine::Product => {
        // Mixed radix, last axis varies fastest.
        let mut rem = position;
        let mut out = Vec::with_capacity(axes.len());
        for axis in axes.iter().rev() {
          let n = axis.values.len();
          out.push((axis.param, &axis.values[rem % n]));
          rem /= n;
        }
        out.reverse();
        out
      }
    }
  }

  /// Effective (threads, memory limit) at a position.
  fn knobs(&self, position: usize) -> (&str, &str) {
    let mut threads = self.plan.defaults.threads.as_str();
    let mut memory_limit = self.plan.defaults.memory_limit.as_str();
    for (param, value) in self.assignments(position) {
      match param {
        SweepParam::Threads => threads = value.as_str(),
        SweepParam::MemoryLimit => memory_limit = value.as_str(),
      };
    }
    (threads, memory_limit)
  }

  fn try_point(&self, index: usize) -> Result<RunConfig, ResolveError> {
    let plan = &self.plan;
    let (threads, memory_limit) = self.knobs(self.positions[index]);

    let output = match &self.template {
      Some(template) => {
        let rendered = render_template(template, |name| match name {
          "backend" => Some(plan.backend.slug().to_string()),
          "table" => Some(plan.dataset.table.clone()),
          "threads" => Some(threads.to_string()),
          "memory" => Some(memory_limit.to_string()),
          "point" => Some(index.to_string()),
          _ => None,
        })?;
        Some(self.work_dir.join(rendered))
      }
      None => None,
    };

    Ok(RunConfig {
      sweep: self.sweep.clone(),
      backend: plan.backend,
      input: plan.dataset.input.clone(),
      format: plan.dataset.format,
      location: plan.dataset.location.clone(),
      database: plan.dataset.database.clone(),
      table: plan.dataset.table.clone(),
      load_threads: plan.dataset.load_threads,
      threads: threads.to_string(),
      memory_limit: memory_limit.to_string(),
      temp_dir: plan.defaults.temp_dir.clone(),
      output,
      timeout_secs: plan.timeout_secs,
    })
  }

  fn check_artifacts_unique(&self) -> Result<(), ResolveError> {
    let mut seen = HashMap::<PathBuf, usize>::new();
    for index in 0..self.len() {
      let Some(path) = self.try_point(index)?.output else {
        continue;
      };
      if let Some(&first) = seen.get(&path) {
        return Err(ResolveError::ArtifactCollision {
          first,
          second: index,
          path,
        });
      }
      seen.insert(path, index);
    }
    Ok(())
  }
}

/// Substitutes `{name}` placeholders. Values have path separators replaced so a value can't escape the work directory.
fn render_template(
  template: &str,
  lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ResolveError> {
  let mut out = String::with_capacity(template.len());
  let mut rest = template;
  while let Some(open) = rest.find('{') {
    out.push_str(&rest[..open]);
    let after = &rest[open + 1..];
    let Some(close) = after.find('}') else {
      out.push_str(&rest[open..]);
      return Ok(out);
    };
    let name = &after[..close];
    let value = lookup(name).ok_or_else(|| ResolveError::UnknownPlaceholder {
      name: name.to_string(),
      template: template.to_string(),
    })?;
    out.push_str(&value.replace(['/', '\\'], "_"));
    rest = &after[close + 1..];
  }
  out.push_str(rest);
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn plan(raw: &str) -> SweepPlan {
    serde_yaml::from_str(raw).unwrap()
  }

  fn base(extra: &str) -> SweepPlan {
    plan(&format!(
      r#"
backend: DuckDb
dataset:
  input: data/in.dat
  format: Gensort
  location: bench.duckdb
defaults:
  threads: 8
  memory_limit: 2GB
{extra}
"#
    ))
  }

  fn resolve(plan: SweepPlan) -> Result<Resolver, ResolveError> {
    Resolver::new("t", plan, &Overrides::default(), Path::new("/work"))
  }

  #[test]
  fn test_axis_order_preserved() {
    let r = resolve(base(
      "axes:\n  - param: Threads\n    values: [64, 1, 16]",
    ))
    .unwrap();
    let threads: Vec<String> = r.points().map(|c| c.threads).collect();
    assert_eq!(threads, vec!["64", "1", "16"]);
    assert!(r.points().all(|c| c.memory_limit == "2GB"));
  }

  #[test]
  fn test_restartable() {
    let r = resolve(base(
      "axes:\n  - param: MemoryLimit\n    values: [1GB, 4GB]",
    ))
    .unwrap();
    let a: Vec<RunConfig> = r.points().collect();
    let b: Vec<RunConfig> = r.points().collect();
    assert_eq!(a, b);
    assert_eq!(a.len(), 2);
  }

  #[test]
  fn test_no_axes_single_point() {
    let r = resolve(base("")).unwrap();
    let points: Vec<RunConfig> = r.points().collect();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].threads, "8");
    assert_eq!(
      points[0].output.as_deref(),
      Some(Path::new("/work/bench_data-sorted-8t-2GB.parquet"))
    );
  }

  #[test]
  fn test_vary_holds_other_axes_fixed() {
    let r = resolve(base(
      "axes:\n  - param: Threads\n    values: [1, 2]\n  - param: MemoryLimit\n    values: [512MB, 4GB]",
    ))
    .unwrap();
    let points: Vec<(String, String)> = r
      .points()
      .map(|c| (c.threads, c.memory_limit))
      .collect();
    assert_eq!(
      points,
      vec![
        ("1".to_string(), "2GB".to_string()),
        ("2".to_string(), "2GB".to_string()),
        ("8".to_string(), "512MB".to_string()),
        ("8".to_string(), "4GB".to_string()),
      ]
    );
  }

  #[test]
  fn test_product() {
    let r = resolve(base(
      "combine: Product\naxes:\n  - param: Threads\n    values: [1, 2]\n  - param: MemoryLimit\n    values: [512MB, 4GB, 8GB]",
    ))
    .unwrap();
    assert_eq!(r.len(), 6);
    let points: Vec<(String, String)> = r
      .points()
      .map(|c| (c.threads, c.memory_limit))
      .collect();
    assert_eq!(points[0], ("1".to_string(), "512MB".to_string()));
    assert_eq!(points[2], ("1".to_string(), "8GB".to_string()));
    assert_eq!(points[3], ("2".to_string(), "512MB".to_string()));
  }

  #[test]
  fn test_empty_value_rejected() {
    let err = resolve(base(
      "axes:\n  - param: Threads\n    values: [\"4\", \"\"]",
    ))
    .unwrap_err();
    assert!(matches!(err, ResolveError::EmptyValue { index: 1, .. }));
  }

  #[test]
  fn test_empty_axis_rejected() {
    let err = resolve(base("axes:\n  - param: Threads\n    values: []")).unwrap_err();
    assert!(matches!(err, ResolveError::EmptyAxis { .. }));
  }

  #[test]
  fn test_malformed_memory_passes_through() {
    let r = resolve(base(
      "axes:\n  - param: MemoryLimit\n    values: [lots]",
    ))
    .unwrap();
    assert_eq!(r.point(0).memory_limit, "lots");
  }

  #[test]
  fn test_colliding_artifacts_rejected() {
    let mut p = base("axes:\n  - param: Threads\n    values: [4, 4]");
    p.defaults.output = Some("sorted-{memory}.parquet".to_string());
    let err = resolve(p).unwrap_err();
    match err {
      ResolveError::ArtifactCollision { first, second, path } => {
        assert_eq!((first, second), (0, 1));
        assert_eq!(path, PathBuf::from("/work/sorted-2GB.parquet"));
      }
      other => panic!("unexpected error {other:?}"),
    }
  }

  #[test]
  fn test_duplicate_values_collide_without_point_placeholder() {
    let p = base("axes:\n  - param: Threads\n    values: [4, 4]");
    assert!(matches!(
      resolve(p),
      Err(ResolveError::ArtifactCollision { .. })
    ));

    let mut p = base("axes:\n  - param: Threads\n    values: [4, 4]");
    p.defaults.output = Some("run{point}-{threads}.parquet".to_string());
    let r = resolve(p).unwrap();
    assert_eq!(
      r.point(1).output,
      Some(PathBuf::from("/work/run1-4.parquet"))
    );
  }

  #[test]
  fn test_no_artifact_never_collides() {
    let mut p = base("axes:\n  - param: Threads\n    values: [4, 4]");
    p.backend = BackendKind::ClickHouse;
    let r = resolve(p).unwrap();
    assert!(r.points().all(|c| c.output.is_none()));
  }

  #[test]
  fn test_unknown_placeholder_rejected() {
    let mut p = base("");
    p.defaults.output = Some("{colour}.parquet".to_string());
    assert!(matches!(
      resolve(p),
      Err(ResolveError::UnknownPlaceholder { .. })
    ));
  }

  #[test]
  fn test_absolute_template_and_separator_escaping() {
    let mut p = base("axes:\n  - param: MemoryLimit\n    values: [a/b]");
    p.defaults.output = Some("/mnt/out/{backend}-{memory}.parquet".to_string());
    let r = resolve(p).unwrap();
    assert_eq!(
      r.point(0).output,
      Some(PathBuf::from("/mnt/out/duckdb-a_b.parquet"))
    );
  }

  #[test]
  fn test_overrides_apply_over_plan() {
    let overrides = Overrides {
      threads: Some("32".to_string()),
      timeout_secs: Some(10),
      location: Some("other.duckdb".to_string()),
      ..Default::default()
    };
    let r = Resolver::new("t", base(""), &overrides, Path::new("/work")).unwrap();
    let c = r.point(0);
    assert_eq!(c.threads, "32");
    assert_eq!(c.timeout_secs, 10);
    assert_eq!(c.location, "other.duckdb");
    assert_eq!(c.memory_limit, "2GB");
  }
  #[test]
  fn test_vary_skips_repeated_default_point() {
    let axes = "axes:\n  - param: Threads\n    values: [64, 16]\n  - param: MemoryLimit\n    values: [32GB, 16GB]";
    let mut p = base(axes);
    p.defaults.threads = Knob("16".to_string());
    p.defaults.memory_limit = Knob("16GB".to_string());
    let expected = vec![
      ("64".to_string(), "16GB".to_string()),
      ("16".to_string(), "16GB".to_string()),
      ("16".to_string(), "32GB".to_string()),
    ];

    let r = resolve(p.clone()).unwrap();
    assert_eq!(r.len(), 3);
    let points: Vec<(String, String)> = r.points().map(|c| (c.threads, c.memory_limit)).collect();
    assert_eq!(points, expected);
    assert_eq!(
      r.point(2).output,
      Some(PathBuf::from("/work/bench_data-sorted-16t-32GB.parquet"))
    );

    p.backend = BackendKind::ClickHouse;
    let r = resolve(p).unwrap();
    let configs: Vec<RunConfig> = r.points().collect();
    let points: Vec<(String, String)> = configs
      .iter()
      .map(|c| (c.threads.clone(), c.memory_limit.clone()))
      .collect();
    assert_eq!(points, expected);
    for (i, a) in configs.iter().enumerate() {
      assert!(configs[i + 1..].iter().all(|b| b != a));
    }
  }

  #[test]
  fn test_point_placeholder_counts_distinct_points() {
    let mut p = base("axes:\n  - param: Threads\n    values: [8, 1]\n  - param: MemoryLimit\n    values: [2GB, 4GB]");
    p.defaults.output = Some("p{point}".to_string());
    let r = resolve(p).unwrap();
    let outputs: Vec<PathBuf> = r.points().filter_map(|c| c.output).collect();
    assert_eq!(
      outputs,
      vec![
        PathBuf::from("/work/p0"),
        PathBuf::from("/work/p1"),
        PathBuf::from("/work/p2"),
      ]
    );
    assert_eq!(r.point(2).memory_limit, "4GB");
  }

  #[test]
  fn test_artifact_overlapping_dataset_rejected() {
    let with_output = |output: &str| {
      let mut p = base("");
      p.dataset.location = "/data/bench.duckdb".to_string();
      p.dataset.input = PathBuf::from("/raw/in.dat");
      p.defaults.output = Some(output.to_string());
      resolve(p)
    };

    for output in ["/data/bench.duckdb", "/data", "/raw/in.dat", "/", "."] {
      match with_output(output) {
        Err(ResolveError::ArtifactOverlap { point: 0, .. }) => {}
        other => panic!("{output}: unexpected {other:?}"),
      }
    }
    assert!(with_output("/data/sorted-{threads}.parquet").is_ok());
    assert!(with_output("/data/bench.duckdb.sorted").is_ok());
  }

  #[test]
  fn test_postgres_location_is_not_a_path() {
    let mut p = base("");
    p.backend = BackendKind::Postgres;
    p.dataset.location = "/work/out".to_string();
    p.defaults.output = Some("out".to_string());
    assert!(resolve(p).is_ok());
  }

  #[test]
  fn test_check_protected() {
    let mut p = base("axes:\n  - param: Threads\n    values: [1, 2]");
    p.defaults.output = Some("/sweep/{threads}".to_string());
    let r = resolve(p).unwrap();
    assert!(r.check_protected(Path::new("/sweep/logs")).is_ok());
    match r.check_protected(Path::new("/sweep/2/ledger.jsonl")) {
      Err(ResolveError::ArtifactOverlap {
        point, protected, ..
      }) => {
        assert_eq!(point, 1);
        assert_eq!(protected, PathBuf::from("/sweep/2/ledger.jsonl"));
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn test_plan_paths_relative_to_sweep_folder() {
    let mut p = base("work_dir: scratch\npostgres:\n  cache_reset_script: restart.sh");
    resolve_plan_paths(&mut p, Path::new("/cfg/sweep"));
    assert_eq!(p.dataset.input, PathBuf::from("/cfg/sweep/data/in.dat"));
    assert_eq!(p.dataset.location, "/cfg/sweep/bench.duckdb");
    assert_eq!(p.work_dir, Some(PathBuf::from("/cfg/sweep/scratch")));
    assert_eq!(
      p.postgres.cache_reset_script,
      Some(PathBuf::from("/cfg/sweep/restart.sh"))
    );

    let mut p = base("");
    p.backend = BackendKind::Postgres;
    p.dataset.location = "postgres://bench@localhost/bench".to_string();
    p.dataset.input = PathBuf::from("/abs/in.dat");
    resolve_plan_paths(&mut p, Path::new("/cfg/sweep"));
    assert_eq!(p.dataset.location, "postgres://bench@localhost/bench");
    assert_eq!(p.dataset.input, PathBuf::from("/abs/in.dat"));
  }
}
