use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid line {line}: {content}")]
    InvalidLine { line: usize, content: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorLabel {
    pub label: String,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// Class id to label table, indexed by the model's class output position.
#[derive(Debug, Clone, Default)]
pub struct ClassLabels {
    class_labels: Vec<ColorLabel>,
}

impl ClassLabels {
    pub fn new(class_labels: Vec<ColorLabel>) -> Self {
        Self { class_labels }
    }

    pub fn from_file(path: &Path) -> Result<Self, LabelsError> {
        Ok(Self::new(load_yolov8_labels(path)?))
    }

    pub fn get(&self, class_id: u32) -> Option<&ColorLabel> {
        self.class_labels.get(class_id as usize)
    }

    /// Label for `class_id`, falling back to the id itself.
    pub fn name(&self, class_id: u32) -> String {
        match self.get(class_id) {
            Some(color_label) => color_label.label.clone(),
            None => class_id.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.class_labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_labels.is_empty()
    }
}

/// Parses `label,red,green,blue` lines. Blank lines are ignored.
pub fn load_yolov8_labels(filepath: &Path) -> Result<Vec<ColorLabel>, LabelsError> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

fn parse_labels<R: BufRead>(reader: R) -> Result<Vec<ColorLabel>, LabelsError> {
    let mut color_labels = Vec::new();

    for (index, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let invalid = || LabelsError::InvalidLine {
            line: index + 1,
            content: line.clone(),
        };

        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 4 {
            return Err(invalid());
        }

        let label = parts[0].trim().to_string();
        let red: u8 = parts[1].trim().parse().map_err(|_| invalid())?;
        let green: u8 = parts[2].trim().parse().map_err(|_| invalid())?;
        let blue: u8 = parts[3].trim().parse().map_err(|_| invalid())?;

        color_labels.push(ColorLabel {
            label,
            red,
            green,
            blue,
        });
    }

    Ok(color_labels)
}
