/*! Rectangle packer used by the texture atlas.
 *
 * Finds a placement that maximizes contact surface with previously allocated
 * space. Free space is tracked as a set of free/occupied boundary edges, with
 * a coarse lookup grid to accelerate the scoring queries. Unlike simpler
 * shelf packers, the packing area can be grown without clearing already
 * placed rects.
 */

#[derive(Clone, Copy, Debug)]
struct FreeEdge {
    x: i32,
    y: i32,
    length: i32,
    vertical: bool,
    /// Which side of the edge the free space is on.
    up_right_inside: bool,
    marker: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Rect {
    pub w: i32,
    pub h: i32,
    pub x: i32,
    pub y: i32,
    pub packed: bool,
    pub rotated: bool,
}

impl Rect {
    pub fn new(w: i32, h: i32) -> Self {
        Self {
            w,
            h,
            x: 0,
            y: 0,
            packed: false,
            rotated: false,
        }
    }
}

pub struct RectPacker {
    edges: Vec<FreeEdge>,
    canvas_w: i32,
    canvas_h: i32,
    edge_lookup: Vec<Vec<usize>>,
    lookup_w: i32,
    lookup_h: i32,
    cell_size: i32,
    open: bool,
    marker: u32,
}

fn calc_overlap(x1: i32, w1: i32, x2: i32, w2: i32) -> i32 {
    ((x1 + w1).min(x2 + w2) - x1.max(x2)).max(0)
}

fn auto_cell_size(total_area: i32) -> i32 {
    // Largely empirical; follows measured sweet spots for varying rect sizes.
    (total_area.max(1) as f64).powf(1.0 / 6.0).ceil() as i32
}

impl RectPacker {
    /// `w` and `h` set the size of the packing area. See [`set_open`] for
    /// `open`.
    ///
    /// [`set_open`]: RectPacker::set_open
    pub fn new(w: i32, h: i32, open: bool) -> Self {
        let mut packer = Self {
            edges: Vec::new(),
            canvas_w: w,
            canvas_h: h,
            edge_lookup: Vec::new(),
            lookup_w: 0,
            lookup_h: 0,
            cell_size: 16,
            open,
            marker: 0,
        };
        packer.reset_size(w, h);
        packer
    }

    /// Grows the packing area without clearing already packed rects.
    /// Shrinking is not allowed; smaller dimensions are clamped.
    pub fn enlarge(&mut self, w: i32, h: i32) {
        let w = w.max(self.canvas_w);
        let h = h.max(self.canvas_h);

        let mut removed = Vec::new();
        let mut top_edges = Vec::new();
        let mut right_edges = Vec::new();

        self.marker += 1;
        let marker = self.marker;

        if h > self.canvas_h {
            top_edges.push(FreeEdge {
                x: 0,
                y: self.canvas_h,
                length: self.canvas_w,
                vertical: false,
                up_right_inside: true,
                marker,
            });

            for i in 0..self.lookup_w {
                let cell = ((self.lookup_h - 1) * self.lookup_w + i) as usize;
                for ei in self.edge_lookup[cell].clone() {
                    let edge = self.edges[ei];
                    if edge.vertical || edge.y != self.canvas_h || edge.marker == marker {
                        continue;
                    }
                    self.edges[ei].marker = marker;
                    edge_clip(&edge, &mut top_edges, marker);
                    removed.push(ei);
                }
            }

            top_edges.push(FreeEdge {
                x: 0,
                y: self.canvas_h,
                length: h - self.canvas_h,
                vertical: true,
                up_right_inside: true,
                marker,
            });
            top_edges.push(FreeEdge {
                x: 0,
                y: h,
                length: w,
                vertical: false,
                up_right_inside: false,
                marker,
            });
            if w <= self.canvas_w {
                top_edges.push(FreeEdge {
                    x: w,
                    y: self.canvas_h,
                    length: h - self.canvas_h,
                    vertical: true,
                    up_right_inside: false,
                    marker,
                });
            }
        }

        if w > self.canvas_w {
            right_edges.push(FreeEdge {
                x: self.canvas_w,
                y: 0,
                length: self.canvas_h,
                vertical: true,
                up_right_inside: true,
                marker,
            });

            for i in 0..self.lookup_h {
                let cell = (i * self.lookup_w + self.lookup_w - 1) as usize;
                for ei in self.edge_lookup[cell].clone() {
                    let edge = self.edges[ei];
                    if !edge.vertical || edge.x != self.canvas_w || edge.marker == marker {
                        continue;
                    }
                    self.edges[ei].marker = marker;
                    edge_clip(&edge, &mut right_edges, marker);
                    removed.push(ei);
                }
            }

            right_edges.push(FreeEdge {
                x: self.canvas_w,
                y: 0,
                length: w - self.canvas_w,
                vertical: false,
                up_right_inside: true,
                marker,
            });
            right_edges.push(FreeEdge {
                x: w,
                y: 0,
                length: h,
                vertical: true,
                up_right_inside: false,
                marker,
            });
            if h <= self.canvas_h {
                right_edges.push(FreeEdge {
                    x: self.canvas_w,
                    y: h,
                    length: w - self.canvas_w,
                    vertical: false,
                    up_right_inside: false,
                    marker,
                });
            }
        }

        self.remove_edges(&mut removed);
        self.edges.extend(top_edges);
        self.edges.extend(right_edges);

        self.canvas_w = w;
        self.canvas_h = h;

        self.set_cell_size(-1);
    }

    /// Clears the packer state and changes the size of the packing area.
    pub fn reset_size(&mut self, w: i32, h: i32) {
        self.canvas_w = w;
        self.canvas_h = h;
        self.lookup_w = (w + self.cell_size - 1) / self.cell_size;
        self.lookup_h = (h + self.cell_size - 1) / self.cell_size;
        self.reset();
    }

    /// Clears the packer state.
    pub fn reset(&mut self) {
        self.edges.clear();
        self.edges.push(FreeEdge {
            x: 0,
            y: 0,
            length: self.canvas_h,
            vertical: true,
            up_right_inside: true,
            marker: 0,
        });
        self.edges.push(FreeEdge {
            x: 0,
            y: 0,
            length: self.canvas_w,
            vertical: false,
            up_right_inside: true,
            marker: 0,
        });
        self.edges.push(FreeEdge {
            x: self.canvas_w,
            y: 0,
            length: self.canvas_h,
            vertical: true,
            up_right_inside: false,
            marker: 0,
        });
        self.edges.push(FreeEdge {
            x: 0,
            y: self.canvas_h,
            length: self.canvas_w,
            vertical: false,
            up_right_inside: false,
            marker: 0,
        });
        self.recalc_edge_lookup();
    }

    /// -1 for automatic. Only affects the speed of the lookup acceleration;
    /// the automatic value is almost always good enough.
    pub fn set_cell_size(&mut self, cell_size: i32) {
        self.cell_size = if cell_size < 1 {
            auto_cell_size(self.canvas_w * self.canvas_h)
        } else {
            cell_size
        };
        self.lookup_w = (self.canvas_w + self.cell_size - 1) / self.cell_size;
        self.lookup_h = (self.canvas_h + self.cell_size - 1) / self.cell_size;
        self.recalc_edge_lookup();
    }

    /// If open, cost approximation is adjusted such that packing after
    /// [`enlarge`] yields better results, at the cost of slightly worse
    /// packing when the canvas never grows.
    ///
    /// [`enlarge`]: RectPacker::enlarge
    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    /// Returns the corner closest to the origin on success, `None` if the
    /// rectangle could not be packed. In that case use [`enlarge`] and retry.
    ///
    /// [`enlarge`]: RectPacker::enlarge
    pub fn pack(&mut self, w: i32, h: i32) -> Option<(i32, i32)> {
        let mut affected = Vec::new();
        let (score, x, y) = self.find_max_score(w, h, &mut affected);
        if score == 0 {
            return None;
        }
        self.place_rect(x, y, w, h, &affected);
        Some((x, y))
    }

    /// [`pack`], but allows 90 degree rotation of the input rectangle. The
    /// second return value is true if rotation happened.
    ///
    /// [`pack`]: RectPacker::pack
    pub fn pack_rotate(&mut self, w: i32, h: i32) -> Option<(i32, i32, bool)> {
        if w == h {
            return self.pack(w, h).map(|(x, y)| (x, y, false));
        }

        let mut affected = Vec::new();
        let mut rot_affected = Vec::new();
        let (score, x, y) = self.find_max_score(w, h, &mut affected);
        let (rot_score, rot_x, rot_y) = self.find_max_score(h, w, &mut rot_affected);
        if score == 0 && rot_score == 0 {
            return None;
        }

        // Prefer the non-rotated orientation on ties.
        if score >= rot_score {
            self.place_rect(x, y, w, h, &affected);
            Some((x, y, false))
        } else {
            self.place_rect(rot_x, rot_y, h, w, &rot_affected);
            Some((rot_x, rot_y, true))
        }
    }

    /// Sorts the inputs by largest dimension and packs them one by one.
    /// Already packed rects are skipped but count towards the returned
    /// number of packed rects.
    pub fn pack_all(&mut self, rects: &mut [Rect], allow_rotation: bool) -> usize {
        let mut order: Vec<usize> = (0..rects.len()).collect();
        order.sort_by(|&a, &b| {
            let da = rects[a].w.max(rects[a].h);
            let db = rects[b].w.max(rects[b].h);
            db.cmp(&da)
        });

        let mut packed = 0;
        for i in order {
            let r = &mut rects[i];
            r.rotated = false;
            if r.packed {
                packed += 1;
                continue;
            }
            if allow_rotation {
                if let Some((x, y, rotated)) = self.pack_rotate(r.w, r.h) {
                    r.x = x;
                    r.y = y;
                    r.rotated = rotated;
                    r.packed = true;
                    packed += 1;
                }
            } else if let Some((x, y)) = self.pack(r.w, r.h) {
                r.x = x;
                r.y = y;
                r.packed = true;
                packed += 1;
            }
        }
        packed
    }

    fn recalc_edge_lookup(&mut self) {
        self.marker = 0;
        self.edge_lookup
            .resize((self.lookup_w * self.lookup_h) as usize, Vec::new());
        for cell in &mut self.edge_lookup {
            cell.clear();
        }

        for (i, edge) in self.edges.iter_mut().enumerate() {
            edge.marker = 0;

            let mut sx = edge.x / self.cell_size;
            let bx = edge.x % self.cell_size;
            let mut sy = edge.y / self.cell_size;
            let by = edge.y % self.cell_size;

            if edge.vertical {
                let ey = (edge.y + edge.length - 1) / self.cell_size;
                let border = bx == 0 && sx > 0;
                while sy <= ey {
                    if sx < self.lookup_w {
                        self.edge_lookup[(sy * self.lookup_w + sx) as usize].push(i);
                    }
                    if border {
                        self.edge_lookup[(sy * self.lookup_w + sx - 1) as usize].push(i);
                    }
                    sy += 1;
                }
            } else {
                let ex = (edge.x + edge.length - 1) / self.cell_size;
                let border = by == 0 && sy > 0;
                while sx <= ex {
                    if sy < self.lookup_h {
                        self.edge_lookup[(sy * self.lookup_w + sx) as usize].push(i);
                    }
                    if border {
                        self.edge_lookup[((sy - 1) * self.lookup_w + sx) as usize].push(i);
                    }
                    sx += 1;
                }
            }
        }
    }

    fn find_max_score(&mut self, w: i32, h: i32, best_affected: &mut Vec<usize>) -> (i32, i32, i32) {
        let mut best_score = 0;
        let mut best_x = 0;
        let mut best_y = 0;
        let ideal = (w + h) * 2;
        let mut affected = Vec::new();

        for ei in 0..self.edges.len() {
            let edge = self.edges[ei];
            if edge.vertical {
                let mut x = edge.x;
                if !edge.up_right_inside {
                    x -= w;
                }
                if x < 0 || x + w > self.canvas_w {
                    continue;
                }

                let ey = (edge.y + edge.length).min(self.canvas_h - h + 1);
                let mut y = edge.y;
                while y < ey {
                    let (score, skip) = self.score_rect(x, y, w, h, true, ey, &mut affected);
                    if score > best_score {
                        best_score = score;
                        best_x = x;
                        best_y = y;
                        best_affected.clone_from(&affected);
                    }
                    y += skip.max(1);
                }
            } else {
                let mut y = edge.y;
                if !edge.up_right_inside {
                    y -= h;
                }
                if y < 0 || y + h > self.canvas_h {
                    continue;
                }

                let ex = (edge.x + edge.length).min(self.canvas_w - w + 1);
                let mut x = edge.x;
                while x < ex {
                    let (score, skip) = self.score_rect(x, y, w, h, false, ex, &mut affected);
                    if score > best_score {
                        best_score = score;
                        best_x = x;
                        best_y = y;
                        best_affected.clone_from(&affected);
                    }
                    x += skip.max(1);
                }
            }
            if best_score == ideal {
                break;
            }
        }
        (best_score, best_x, best_y)
    }

    // Scores one candidate placement. The second return value is the step
    // along the tracked edge until the score could possibly improve.
    fn score_rect(
        &mut self,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        vertical: bool,
        end: i32,
        affected: &mut Vec<usize>,
    ) -> (i32, i32) {
        affected.clear();

        let mut score = 0;
        let sx = x / self.cell_size;
        let sy = y / self.cell_size;
        let ex = (x + w - 1) / self.cell_size;
        let ey = (y + h - 1) / self.cell_size;

        let mut end = if vertical {
            end.min((ey + 1) * self.cell_size)
        } else {
            end.min((ex + 1) * self.cell_size)
        };

        self.marker += 1;
        let marker = self.marker;
        for cy in sy..=ey {
            for cx in sx..=ex {
                let cell = (cy * self.lookup_w + cx) as usize;
                for i in 0..self.edge_lookup[cell].len() {
                    let ei = self.edge_lookup[cell][i];
                    if self.edges[ei].marker == marker {
                        continue;
                    }
                    self.edges[ei].marker = marker;
                    let edge = self.edges[ei];

                    let escore = self.score_rect_edge(x, y, w, h, &edge);
                    if escore == -1 {
                        // Placement is blocked; report how far to skip ahead.
                        let skip = if vertical {
                            edge.y + edge.length - y
                        } else {
                            edge.x + edge.length - x
                        };
                        return (0, skip);
                    }

                    if escore > 0 {
                        affected.push(ei);
                        score += escore;
                    }

                    if vertical {
                        if edge.vertical && edge.x == x + w && edge.y > y {
                            end = end.min(edge.y);
                        } else if !edge.vertical
                            && edge.y > y + h
                            && edge.x < x + w
                            && edge.x + edge.length > x
                        {
                            end = end.min(edge.y - h);
                        }
                    } else if !edge.vertical && edge.y == y + h && edge.x > x {
                        end = end.min(edge.x);
                    } else if edge.vertical
                        && edge.x > x + w
                        && edge.y < y + h
                        && edge.y + edge.length > y
                    {
                        end = end.min(edge.x - w);
                    }
                }
            }
        }

        let skip = if vertical { end - y } else { end - x };
        (score, skip)
    }

    // -1 means the edge blocks this placement. 0 or above is the length of
    // shared contact along the edge.
    fn score_rect_edge(&self, x: i32, y: i32, w: i32, h: i32, edge: &FreeEdge) -> i32 {
        if edge.vertical {
            let score = calc_overlap(y, h, edge.y, edge.length);
            if edge.x > x && edge.x < x + w && score > 0 {
                return -1;
            }
            if self.open && edge.x == self.canvas_w {
                return 0;
            }
            if x == edge.x || x + w == edge.x {
                return score;
            }
        } else {
            let score = calc_overlap(x, w, edge.x, edge.length);
            if edge.y > y && edge.y < y + h && score > 0 {
                return -1;
            }
            if self.open && edge.y == self.canvas_h {
                return 0;
            }
            if y == edge.y || y + h == edge.y {
                return score;
            }
        }
        0
    }

    fn place_rect(&mut self, x: i32, y: i32, w: i32, h: i32, affected: &[usize]) {
        let marker = self.marker;
        let mut new_edges = Vec::new();
        let mut delete_edges = Vec::new();

        let mut vert_rect_edges = vec![
            FreeEdge {
                x,
                y,
                length: h,
                vertical: true,
                up_right_inside: false,
                marker,
            },
            FreeEdge {
                x: x + w,
                y,
                length: h,
                vertical: true,
                up_right_inside: true,
                marker,
            },
        ];
        let mut hori_rect_edges = vec![
            FreeEdge {
                x,
                y,
                length: w,
                vertical: false,
                up_right_inside: false,
                marker,
            },
            FreeEdge {
                x,
                y: y + h,
                length: w,
                vertical: false,
                up_right_inside: true,
                marker,
            },
        ];

        for &ei in affected {
            let edge = self.edges[ei];
            let (a, b) = if edge.vertical {
                let a = FreeEdge {
                    length: y - edge.y,
                    marker,
                    ..edge
                };
                let b = FreeEdge {
                    y: y + h,
                    length: edge.y + edge.length - y - h,
                    marker,
                    ..edge
                };
                edge_clip(&edge, &mut vert_rect_edges, marker);
                (a, b)
            } else {
                let a = FreeEdge {
                    length: x - edge.x,
                    marker,
                    ..edge
                };
                let b = FreeEdge {
                    x: x + w,
                    length: edge.x + edge.length - x - w,
                    marker,
                    ..edge
                };
                edge_clip(&edge, &mut hori_rect_edges, marker);
                (a, b)
            };

            if a.length > 0 && b.length > 0 {
                self.edges[ei] = a;
                new_edges.push(b);
            } else if a.length > 0 {
                self.edges[ei] = a;
            } else if b.length > 0 {
                self.edges[ei] = b;
            } else {
                delete_edges.push(ei);
            }
        }

        self.remove_edges(&mut delete_edges);
        self.edges.extend(new_edges);
        self.edges.extend(vert_rect_edges);
        self.edges.extend(hori_rect_edges);

        self.recalc_edge_lookup();
    }

    fn remove_edges(&mut self, indices: &mut Vec<usize>) {
        indices.sort_unstable();
        indices.dedup();
        for &i in indices.iter().rev() {
            self.edges.remove(i);
        }
    }
}

// Clips every edge in `clipped` against the span covered by `mask`,
// splitting or dropping edges as needed.
fn edge_clip(mask: &FreeEdge, clipped: &mut Vec<FreeEdge>, marker: u32) {
    let mut i = 0;
    while i < clipped.len() {
        let edge = clipped[i];
        let (a, b) = if mask.vertical {
            if mask.x != edge.x {
                i += 1;
                continue;
            }
            let a = FreeEdge {
                length: (mask.y - edge.y).min(edge.length),
                marker,
                ..edge
            };
            let by = (mask.y + mask.length).max(edge.y);
            let b = FreeEdge {
                y: by,
                length: edge.y + edge.length - by,
                marker,
                ..edge
            };
            (a, b)
        } else {
            if mask.y != edge.y {
                i += 1;
                continue;
            }
            let a = FreeEdge {
                length: (mask.x - edge.x).min(edge.length),
                marker,
                ..edge
            };
            let bx = (mask.x + mask.length).max(edge.x);
            let b = FreeEdge {
                x: bx,
                length: edge.x + edge.length - bx,
                marker,
                ..edge
            };
            (a, b)
        };

        if a.length > 0 && b.length > 0 {
            clipped[i] = a;
            clipped.push(b);
            i += 1;
        } else if a.length > 0 {
            clipped[i] = a;
            i += 1;
        } else if b.length > 0 {
            clipped[i] = b;
            i += 1;
        } else {
            clipped.remove(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlaps(a: &Rect, b: &Rect) -> bool {
        let (aw, ah) = if a.rotated { (a.h, a.w) } else { (a.w, a.h) };
        let (bw, bh) = if b.rotated { (b.h, b.w) } else { (b.w, b.h) };
        a.x < b.x + bw && b.x < a.x + aw && a.y < b.y + bh && b.y < a.y + ah
    }

    // Deterministic xorshift so the test rects are stable across runs.
    fn xorshift(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    #[test]
    fn pack_single_touches_origin_corner_area() {
        let mut packer = RectPacker::new(64, 64, false);
        let (x, y) = packer.pack(16, 16).unwrap();
        assert!(x >= 0 && y >= 0);
        assert!(x + 16 <= 64 && y + 16 <= 64);
    }

    #[test]
    fn pack_full_canvas_then_fail() {
        let mut packer = RectPacker::new(32, 32, false);
        assert!(packer.pack(32, 32).is_some());
        assert!(packer.pack(1, 1).is_none());
    }

    #[test]
    fn pack_is_deterministic_after_reset() {
        let sizes = [(10, 7), (3, 12), (8, 8), (15, 2), (6, 9), (4, 4)];
        let mut packer = RectPacker::new(40, 40, false);
        let first: Vec<_> = sizes.iter().map(|&(w, h)| packer.pack(w, h)).collect();
        packer.reset();
        let second: Vec<_> = sizes.iter().map(|&(w, h)| packer.pack(w, h)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn packed_rects_never_overlap() {
        let mut state = 0x12345678u32;
        let mut rects: Vec<Rect> = (0..50)
            .map(|_| {
                let w = (xorshift(&mut state) % 64 + 1) as i32;
                let h = (xorshift(&mut state) % 64 + 1) as i32;
                Rect::new(w, h)
            })
            .collect();

        let mut packer = RectPacker::new(256, 256, false);
        packer.pack_all(&mut rects, true);

        let packed: Vec<&Rect> = rects.iter().filter(|r| r.packed).collect();
        for i in 0..packed.len() {
            for j in (i + 1)..packed.len() {
                assert!(
                    !overlaps(packed[i], packed[j]),
                    "rects {i} and {j} overlap: {:?} vs {:?}",
                    packed[i],
                    packed[j]
                );
            }
        }
    }

    #[test]
    fn packed_rects_stay_in_bounds() {
        let mut state = 0xdeadbeefu32;
        let mut rects: Vec<Rect> = (0..30)
            .map(|_| {
                let w = (xorshift(&mut state) % 48 + 1) as i32;
                let h = (xorshift(&mut state) % 48 + 1) as i32;
                Rect::new(w, h)
            })
            .collect();

        let mut packer = RectPacker::new(128, 128, false);
        packer.pack_all(&mut rects, false);
        for r in rects.iter().filter(|r| r.packed) {
            assert!(r.x >= 0 && r.y >= 0);
            assert!(r.x + r.w <= 128 && r.y + r.h <= 128);
        }
    }

    #[test]
    fn enlarge_keeps_existing_rects_and_fits_more() {
        let mut packer = RectPacker::new(32, 32, true);
        let a = packer.pack(32, 32).unwrap();
        assert!(packer.pack(16, 16).is_none());

        packer.enlarge(64, 64);
        let b = packer.pack(16, 16).unwrap();

        let ra = Rect {
            w: 32,
            h: 32,
            x: a.0,
            y: a.1,
            packed: true,
            rotated: false,
        };
        let rb = Rect {
            w: 16,
            h: 16,
            x: b.0,
            y: b.1,
            packed: true,
            rotated: false,
        };
        assert!(!overlaps(&ra, &rb));
        assert!(rb.x + 16 <= 64 && rb.y + 16 <= 64);
    }

    #[test]
    fn small_rects_all_fit() {
        let mut rects: Vec<Rect> = (0..16).map(|_| Rect::new(8, 8)).collect();
        let mut packer = RectPacker::new(64, 64, false);
        let packed = packer.pack_all(&mut rects, false);
        assert_eq!(packed, 16);
    }
}
