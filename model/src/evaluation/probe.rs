use ndarray::{Array2, Axis};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::images::{save_image, stack_images};
use crate::error::{CapsNetError, Result};
use crate::model::core::CapsNet;
use crate::train_data::symmetric_forms::{generate_image, FormSettings, RECTANGLE, TRIANGLE};

/// Primary (num_primary, dim) and class (num_classes, out_dim) capsules for one rendered form.
pub fn capsules_for_settings(model: &mut CapsNet, settings: &FormSettings) -> Result<(Array2<f32>, Array2<f32>)> {
    let (_, height, width) = model.config.input_shape;
    let (image, _) = generate_image(width, height, settings)?;
    let output = model.probe(&image.insert_axis(Axis(0)).view())?;
    Ok((
        output.primary_capsules.index_axis_move(Axis(0), 0),
        output.class_capsules.index_axis_move(Axis(0), 0),
    ))
}

struct CsvTable {
    writer: BufWriter<File>,
}

impl CsvTable {
    fn create(path: &Path, header: &[String]) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", header.join(","))?;
        Ok(Self { writer })
    }

    fn row(&mut self, values: impl IntoIterator<Item = f32>) -> Result<()> {
        let cells: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
        writeln!(self.writer, "{}", cells.join(","))?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn columns(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|d| format!("{}{}", prefix, d)).collect()
}

fn header(leading: &[&str], groups: &[(&str, usize)]) -> Vec<String> {
    let mut out: Vec<String> = leading.iter().map(|s| s.to_string()).collect();
    for (prefix, count) in groups {
        out.extend(columns(prefix, *count));
    }
    out
}

/// Class capsule `class` while the form rotates through phi = -2.0..=2.0.
pub fn digit_output_vs_phi(model: &mut CapsNet, class: usize, path: &Path) -> Result<()> {
    let out_dim = model.config.out_dim;
    let mut table = CsvTable::create(path, &header(&["phi"], &[("dim_", out_dim)]))?;
    for i in -20..=20 {
        let phi = i as f32 / 10.0;
        let settings = FormSettings::new(class, (0.1, 0.0), phi, (0.4, 0.2));
        let (_, digits) = capsules_for_settings(model, &settings)?;
        table.row(std::iter::once(phi).chain(digits.row(class).iter().copied()))?;
    }
    table.finish()
}

/// Class capsule `class` while the form moves vertically, in two columns.
pub fn digit_output_vs_position(model: &mut CapsNet, class: usize, path: &Path) -> Result<()> {
    let out_dim = model.config.out_dim;
    let mut table = CsvTable::create(path, &header(&["x", "y"], &[("dim_", out_dim)]))?;
    for x in [0.0, 0.3] {
        for i in -5..=5 {
            let y = i as f32 / 10.0;
            let settings = FormSettings::new(class, (x, y), 0.0, (0.4, 0.2));
            let (_, digits) = capsules_for_settings(model, &settings)?;
            table.row([x, y].into_iter().chain(digits.row(class).iter().copied()))?;
        }
    }
    table.finish()
}

/// Every primary capsule for phi = 0 next to phi = 1.
pub fn primary_output_change(model: &mut CapsNet, class: usize, path: &Path) -> Result<()> {
    let first = capsules_for_settings(model, &FormSettings::new(class, (0.0, 0.0), 0.0, (0.4, 0.2)))?.0;
    let second = capsules_for_settings(model, &FormSettings::new(class, (0.0, 0.0), 1.0, (0.4, 0.2)))?.0;
    write_primary_pair(path, "phi0_dim_", &first, "phi1_dim_", &second)
}

/// Primary capsules of the rectangle next to those of the triangle.
pub fn primary_compare(model: &mut CapsNet, path: &Path) -> Result<()> {
    let rect = capsules_for_settings(model, &FormSettings::new(RECTANGLE, (0.0, 0.0), 0.0, (0.4, 0.2)))?.0;
    let tri = capsules_for_settings(model, &FormSettings::new(TRIANGLE, (0.0, 0.0), 0.0, (0.4, 0.2)))?.0;
    write_primary_pair(path, "rectangle_dim_", &rect, "triangle_dim_", &tri)
}

fn write_primary_pair(path: &Path, first_prefix: &str, first: &Array2<f32>, second_prefix: &str, second: &Array2<f32>) -> Result<()> {
    let dim = first.ncols();
    let mut table = CsvTable::create(
        path,
        &header(&["capsule"], &[(first_prefix, dim), (second_prefix, dim)]),
    )?;
    for (n, (a, b)) in first.outer_iter().zip(second.outer_iter()).enumerate() {
        table.row(
            std::iter::once(n as f32)
                .chain(a.iter().copied())
                .chain(b.iter().copied()),
        )?;
    }
    table.finish()
}

/// One component of one primary capsule type over the spatial grid, for a
/// centred unrotated form and a shifted form rotated by 1 rad.
pub fn primary_per_position(
    model: &mut CapsNet,
    class: usize,
    capsule_type: usize,
    dim: usize,
    path: &Path,
) -> Result<()> {
    let (grid_h, grid_w) = model
        .config
        .primary_grid()
        .ok_or_else(|| CapsNetError::InvalidConfig("primary capsule grid does not fit the input".to_string()))?;
    let primary = &model.config.primary_caps;
    if capsule_type >= primary.capsule_types || dim >= primary.capsule_dim {
        return Err(CapsNetError::InvalidConfig(format!(
            "capsule type {} / dim {} outside {} types of dimension {}",
            capsule_type, dim, primary.capsule_types, primary.capsule_dim
        )));
    }

    let first = capsules_for_settings(model, &FormSettings::new(class, (0.0, 0.0), 0.0, (0.3, 0.2)))?.0;
    let second = capsules_for_settings(model, &FormSettings::new(class, (0.0, 0.1), 1.0, (0.3, 0.2)))?.0;

    let names = ["x", "y", "first", "second"].map(String::from);
    let mut table = CsvTable::create(path, &names)?;
    for x in 0..grid_w {
        for y in 0..grid_h {
            let n = model.primary_caps.capsule_index(y, x, capsule_type, grid_w);
            table.row([x as f32, y as f32, first[[n, dim]], second[[n, dim]]])?;
        }
    }
    table.finish()
}

/// Runs every sweep for `class` and returns the written files.
pub fn run_all_probes(model: &mut CapsNet, class: usize, save_dir: &Path) -> Result<Vec<PathBuf>> {
    let path = |name: &str| save_dir.join(name);
    let files = vec![
        path("digit_output_phi.csv"),
        path("digit_output_position.csv"),
        path("primary_output_change.csv"),
        path("primary_per_position.csv"),
        path("primary_compare.csv"),
    ];
    digit_output_vs_phi(model, class, &files[0])?;
    digit_output_vs_position(model, class, &files[1])?;
    primary_output_change(model, class, &files[2])?;
    let capsule_type = 1usize.min(model.config.primary_caps.capsule_types.saturating_sub(1));
    let dim = 1usize.min(model.config.primary_caps.capsule_dim.saturating_sub(1));
    primary_per_position(model, class, capsule_type, dim, &files[3])?;
    primary_compare(model, &files[4])?;
    info!(count = files.len(), dir = %save_dir.display(), "probe tables written");
    Ok(files)
}

/// Renders the forms the primary capsule sweeps feed the model (`class` at
/// phi 0 and 1, then rectangle and triangle) side by side into `probe_forms.png`.
pub fn save_probe_forms(model: &CapsNet, class: usize, save_dir: &Path) -> Result<PathBuf> {
    let (_, height, width) = model.config.input_shape;
    let settings = [
        FormSettings::new(class, (0.0, 0.0), 0.0, (0.4, 0.2)),
        FormSettings::new(class, (0.0, 0.0), 1.0, (0.4, 0.2)),
        FormSettings::new(RECTANGLE, (0.0, 0.0), 0.0, (0.4, 0.2)),
        FormSettings::new(TRIANGLE, (0.0, 0.0), 0.0, (0.4, 0.2)),
    ];
    let forms = settings
        .iter()
        .map(|s| generate_image(width, height, s).map(|(image, _)| image))
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<_> = forms.iter().map(|f| f.view()).collect();

    let path = save_dir.join("probe_forms.png");
    save_image(&stack_images(&views, views.len())?, &path)?;
    debug!(path = %path.display(), "probe forms saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{LossConfig, NetworkConfig};
    use crate::model::core::tests::tiny_config;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;

    /// Two-class model on 3x12x12 forms.
    fn form_model() -> CapsNet {
        let config = NetworkConfig {
            input_shape: (3, 12, 12),
            num_classes: 2,
            out_dim: 3,
            ..tiny_config()
        };
        let mut rng = StdRng::seed_from_u64(0);
        CapsNet::new(config, &LossConfig::default(), &mut rng).unwrap()
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path).unwrap().lines().map(String::from).collect()
    }

    #[test]
    fn test_capsules_for_settings_shapes() {
        let mut model = form_model();
        let (primary, digits) =
            capsules_for_settings(&mut model, &FormSettings::new(TRIANGLE, (0.0, 0.0), 0.5, (0.4, 0.3))).unwrap();
        // 12 -> conv 10 -> primary 4x4, two types
        assert_eq!(primary.dim(), (32, 4));
        assert_eq!(digits.dim(), (2, 3));
    }

    #[test]
    fn test_phi_sweep_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = form_model();
        let path = dir.path().join("phi.csv");

        digit_output_vs_phi(&mut model, RECTANGLE, &path).unwrap();

        let lines = lines(&path);
        assert_eq!(lines[0], "phi,dim_0,dim_1,dim_2");
        assert_eq!(lines.len(), 1 + 41);
        assert!(lines[1].starts_with("-2,"));
        assert!(lines[41].starts_with("2,"));
    }

    #[test]
    fn test_per_position_covers_grid() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = form_model();
        let path = dir.path().join("pos.csv");

        primary_per_position(&mut model, RECTANGLE, 1, 1, &path).unwrap();

        let lines = lines(&path);
        assert_eq!(lines[0], "x,y,first,second");
        assert_eq!(lines.len(), 1 + 16);
        assert!(primary_per_position(&mut model, RECTANGLE, 2, 0, &path).is_err());
    }

    #[test]
    fn test_run_all_probes_writes_every_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = form_model();

        let files = run_all_probes(&mut model, TRIANGLE, dir.path()).unwrap();

        assert_eq!(files.len(), 5);
        for file in &files {
            assert!(file.exists());
        }
        let compare = lines(&dir.path().join("primary_compare.csv"));
        assert_eq!(compare.len(), 1 + 32);
        assert_eq!(compare[0].split(',').count(), 1 + 2 * 4);
        assert_eq!(lines(&dir.path().join("digit_output_position.csv")).len(), 1 + 22);
    }

    #[test]
    fn test_probe_forms_image_has_one_tile_per_form() {
        let dir = tempfile::tempdir().unwrap();
        let model = form_model();

        let path = save_probe_forms(&model, RECTANGLE, dir.path()).unwrap();

        assert_eq!(path, dir.path().join("probe_forms.png"));
        let image = image::open(&path).unwrap();
        assert_eq!((image.width(), image.height()), (4 * 12, 12));
    }
}
