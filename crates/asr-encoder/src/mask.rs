//! Маска паддинга для батча последовательностей переменной длины.
//!
//! Позиция `t` сэмпла `i` считается дополненной тогда и только тогда,
//! когда `t >= lengths[i]`.

use candle_core::{Device, Shape, Tensor, WithDType};

use asr_core::{AsrError, AsrResult, MaskConfig, MaskPolarity, TensorDType};

/// Ширина маски (ось времени).
#[derive(Debug, Clone, Copy)]
pub enum MaskWidth<'a> {
    /// Явно заданная ширина.
    Explicit(usize),
    /// Длина оси `time_axis` сопутствующего тензора; ось 0 — батч.
    Like {
        features: &'a Tensor,
        time_axis: usize,
    },
    /// Максимальная длина в батче.
    Longest,
}

/// Маска паддинга `(batch, 1, width)`; `true` — позиция дополнена.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingMask {
    batch: usize,
    width: usize,
    padded: Vec<bool>,
}

impl PaddingMask {
    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Логическая форма `(batch, 1, width)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.batch, 1, self.width)
    }

    /// Строка маски сэмпла `i`.
    pub fn row(&self, i: usize) -> &[bool] {
        &self.padded[i * self.width..(i + 1) * self.width]
    }

    pub fn is_padded(&self, i: usize, t: usize) -> bool {
        self.row(i)[t]
    }

    /// Количество валидных позиций в каждой строке (`sum(1 - mask)`).
    pub fn valid_counts(&self) -> Vec<usize> {
        (0..self.batch)
            .map(|i| self.row(i).iter().filter(|&&p| !p).count())
            .collect()
    }

    /// Тензор `(batch, 1, width)` в заданных полярности и типе.
    pub fn to_tensor(
        &self,
        polarity: MaskPolarity,
        dtype: TensorDType,
        device: &Device,
    ) -> AsrResult<Tensor> {
        self.render(polarity, dtype, (self.batch, 1, self.width), device)
    }

    /// Тензор `(batch, width)` в заданных полярности и типе.
    pub fn to_tensor_2d(
        &self,
        polarity: MaskPolarity,
        dtype: TensorDType,
        device: &Device,
    ) -> AsrResult<Tensor> {
        self.render(polarity, dtype, (self.batch, self.width), device)
    }

    fn render(
        &self,
        polarity: MaskPolarity,
        dtype: TensorDType,
        shape: impl Into<Shape>,
        device: &Device,
    ) -> AsrResult<Tensor> {
        match dtype {
            TensorDType::F32 => self.render_as::<f32>(polarity, shape, device),
            TensorDType::F64 => self.render_as::<f64>(polarity, shape, device),
            TensorDType::I64 => self.render_as::<i64>(polarity, shape, device),
            TensorDType::Bool => self.render_as::<u8>(polarity, shape, device),
        }
    }

    fn render_as<T: WithDType>(
        &self,
        polarity: MaskPolarity,
        shape: impl Into<Shape>,
        device: &Device,
    ) -> AsrResult<Tensor> {
        let values: Vec<T> = self
            .padded
            .iter()
            .map(|&padded| {
                let set = match polarity {
                    MaskPolarity::Padded => padded,
                    MaskPolarity::Valid => !padded,
                };
                T::from_f64(if set { 1.0 } else { 0.0 })
            })
            .collect();
        Ok(Tensor::from_vec(values, shape, device)?)
    }
}

/// Построитель масок паддинга.
///
/// Чистая функция от `(lengths, width)`: повторные вызовы с одними
/// аргументами дают одинаковые маски.
#[derive(Debug, Clone, Default)]
pub struct PaddingMaskBuilder {
    table: Option<TriangularTable>,
}

/// Предвычисленные маски для всех длин `1..=size`.
///
/// Строка `r` — маска длины `r + 1`: позиции `t > r` дополнены.
#[derive(Debug, Clone)]
struct TriangularTable {
    size: usize,
    rows: Vec<bool>,
}

impl TriangularTable {
    fn new(size: usize) -> Self {
        let mut rows = Vec::with_capacity(size * size);
        for r in 0..size {
            rows.extend((0..size).map(|t| t > r));
        }
        Self { size, rows }
    }

    fn row(&self, length: usize) -> &[bool] {
        let r = length - 1;
        &self.rows[r * self.size..(r + 1) * self.size]
    }
}

impl PaddingMaskBuilder {
    /// Построитель с прямым сравнением `t >= length`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Построитель с таблицей масок для длин до `max_seq_len`.
    ///
    /// # Ошибки
    /// `AsrError::Config` при `max_seq_len == 0`.
    pub fn with_table(max_seq_len: usize) -> AsrResult<Self> {
        if max_seq_len == 0 {
            return Err(AsrError::Config("max_seq_len должен быть > 0".into()));
        }
        Ok(Self {
            table: Some(TriangularTable::new(max_seq_len)),
        })
    }

    pub fn from_config(config: &MaskConfig) -> AsrResult<Self> {
        match config.max_seq_len {
            Some(max_seq_len) => Self::with_table(max_seq_len),
            None => Ok(Self::new()),
        }
    }

    /// Построить маску.
    ///
    /// # Ошибки
    /// - `InvalidLength` — нулевая длина, длина больше ширины маски или
    ///   больше размера таблицы;
    /// - `ContractViolation` — у сопутствующего тензора нет оси времени или
    ///   размер батча не совпадает с количеством длин.
    pub fn build(&self, lengths: &[usize], width: MaskWidth<'_>) -> AsrResult<PaddingMask> {
        let width = resolve_width(lengths, width)?;

        for (i, &len) in lengths.iter().enumerate() {
            if len == 0 {
                return Err(AsrError::InvalidLength(format!(
                    "сэмпл {i}: нулевая длина недопустима"
                )));
            }
            if len > width {
                return Err(AsrError::InvalidLength(format!(
                    "сэмпл {i}: длина {len} больше ширины маски {width}"
                )));
            }
        }

        let mut padded = Vec::with_capacity(lengths.len() * width);
        match &self.table {
            Some(table) => {
                for (i, &len) in lengths.iter().enumerate() {
                    if len > table.size {
                        return Err(AsrError::InvalidLength(format!(
                            "сэмпл {i}: длина {len} больше max_seq_len {}",
                            table.size
                        )));
                    }
                    let row = table.row(len);
                    let head = width.min(table.size);
                    padded.extend_from_slice(&row[..head]);
                    // за пределами таблицы все позиции дополнены
                    padded.resize(padded.len() + (width - head), true);
                }
            }
            None => {
                for &len in lengths {
                    padded.extend((0..width).map(|t| t >= len));
                }
            }
        }

        Ok(PaddingMask {
            batch: lengths.len(),
            width,
            padded,
        })
    }
}

fn resolve_width(lengths: &[usize], width: MaskWidth<'_>) -> AsrResult<usize> {
    match width {
        MaskWidth::Explicit(m) => Ok(m),
        MaskWidth::Longest => Ok(lengths.iter().copied().max().unwrap_or(0)),
        MaskWidth::Like {
            features,
            time_axis,
        } => {
            let dims = features.dims();
            if time_axis == 0 || time_axis >= dims.len() {
                return Err(AsrError::ContractViolation(format!(
                    "ось времени {time_axis} недопустима для формы {dims:?}"
                )));
            }
            if dims[0] != lengths.len() {
                return Err(AsrError::ContractViolation(format!(
                    "размер батча {} не совпадает с количеством длин {}",
                    dims[0],
                    lengths.len()
                )));
            }
            Ok(dims[time_axis])
        }
    }
}
