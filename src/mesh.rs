use glam::{Vec2, Vec3, Vec4};
use wgpu::util::DeviceExt;

use crate::scene::{Aabb, MeshHandle};

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub uv: [f32; 2],
}

impl MeshVertex {
    pub fn new(position: Vec3, normal: Vec3, tangent: Vec4, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            tangent: tangent.to_array(),
            uv: uv.to_array(),
        }
    }

    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        use std::mem;
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: 12,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: 24,
                    shader_location: 2,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: 40,
                    shader_location: 3,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Mesh {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
    pub bounds: MeshBounds,
}

#[derive(Clone, Debug)]
pub struct MeshBounds {
    pub min: Vec3,
    pub max: Vec3,
    pub center: Vec3,
    pub radius: f32,
}

impl Mesh {
    pub fn new(vertices: Vec<MeshVertex>, indices: Vec<u32>) -> Self {
        let bounds = MeshBounds::from_vertices(&vertices);
        Self { vertices, indices, bounds }
    }

    pub fn cube(size: f32) -> Self {
        let hs = size * 0.5;
        let positions = [
            Vec3::new(-hs, -hs, -hs),
            Vec3::new(hs, -hs, -hs),
            Vec3::new(hs, hs, -hs),
            Vec3::new(-hs, hs, -hs),
            Vec3::new(-hs, -hs, hs),
            Vec3::new(hs, -hs, hs),
            Vec3::new(hs, hs, hs),
            Vec3::new(-hs, hs, hs),
        ];
        let normals = [
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
        ];

        let uv_quad = [Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(1.0, 1.0), Vec2::new(0.0, 1.0)];
        let mut vertices = Vec::with_capacity(24);
        let mut write_face = |indices: [usize; 4], normal: Vec3| {
            for (i, &index) in indices.iter().enumerate() {
                vertices.push(MeshVertex::new(
                    positions[index],
                    normal,
                    Vec4::new(1.0, 0.0, 0.0, 1.0),
                    uv_quad[i],
                ));
            }
        };

        write_face([0, 3, 2, 1], normals[0]); // back
        write_face([4, 5, 6, 7], normals[1]); // front
        write_face([0, 4, 7, 3], normals[2]); // left
        write_face([1, 2, 6, 5], normals[3]); // right
        write_face([3, 7, 6, 2], normals[4]); // top
        write_face([0, 1, 5, 4], normals[5]); // bottom

        let mut indices = Vec::with_capacity(36);
        for face in 0..6 {
            let base = face * 4;
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        compute_tangents(&mut vertices, &indices);

        Self::new(vertices, indices)
    }

    /// Square on the XZ plane facing +Y, subdivided `divisions` times per side.
    pub fn plane(size: f32, divisions: u32) -> Self {
        let divisions = divisions.max(1);
        let step = size / divisions as f32;
        let origin = -size * 0.5;
        let mut vertices = Vec::with_capacity(((divisions + 1) * (divisions + 1)) as usize);
        for z in 0..=divisions {
            for x in 0..=divisions {
                let position = Vec3::new(origin + x as f32 * step, 0.0, origin + z as f32 * step);
                let uv = Vec2::new(x as f32 / divisions as f32, z as f32 / divisions as f32);
                vertices.push(MeshVertex::new(position, Vec3::Y, Vec4::new(1.0, 0.0, 0.0, 1.0), uv));
            }
        }
        let row = divisions + 1;
        let mut indices = Vec::with_capacity((divisions * divisions * 6) as usize);
        for z in 0..divisions {
            for x in 0..divisions {
                let i0 = z * row + x;
                let i1 = i0 + 1;
                let i2 = i0 + row;
                let i3 = i2 + 1;
                indices.extend_from_slice(&[i0, i2, i1, i1, i2, i3]);
            }
        }
        compute_tangents(&mut vertices, &indices);
        Self::new(vertices, indices)
    }

    pub fn uv_sphere(radius: f32, segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut vertices = Vec::with_capacity(((segments + 1) * (rings + 1)) as usize);
        for ring in 0..=rings {
            let v = ring as f32 / rings as f32;
            let theta = v * std::f32::consts::PI;
            for segment in 0..=segments {
                let u = segment as f32 / segments as f32;
                let phi = u * std::f32::consts::TAU;
                let normal = Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
                let tangent = Vec3::new(-phi.sin(), 0.0, phi.cos());
                vertices.push(MeshVertex::new(normal * radius, normal, tangent.extend(1.0), Vec2::new(u, v)));
            }
        }
        let row = segments + 1;
        let mut indices = Vec::with_capacity((segments * rings * 6) as usize);
        for ring in 0..rings {
            for segment in 0..segments {
                let i0 = ring * row + segment;
                let i1 = i0 + 1;
                let i2 = i0 + row;
                let i3 = i2 + 1;
                indices.extend_from_slice(&[i0, i1, i2, i1, i3, i2]);
            }
        }
        Self::new(vertices, indices)
    }

    pub fn local_bounds(&self) -> Aabb {
        Aabb::new(self.bounds.min, self.bounds.max)
    }
}

/// Vertex and index buffers for one uploaded mesh.
pub struct GpuMesh {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
    pub bounds: Aabb,
}

impl GpuMesh {
    pub fn upload(device: &wgpu::Device, mesh: &Mesh, label: &str) -> Self {
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label} Vertex Buffer")),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label} Index Buffer")),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self { vertex_buffer, index_buffer, index_count: mesh.indices.len() as u32, bounds: mesh.local_bounds() }
    }
}

fn compute_tangents(vertices: &mut [MeshVertex], indices: &[u32]) {
    if vertices.is_empty() || indices.is_empty() {
        return;
    }
    let mut tan1 = vec![Vec3::ZERO; vertices.len()];
    let mut tan2 = vec![Vec3::ZERO; vertices.len()];

    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        if i0 >= vertices.len() || i1 >= vertices.len() || i2 >= vertices.len() {
            continue;
        }

        let v0 = Vec3::from_array(vertices[i0].position);
        let delta_pos1 = Vec3::from_array(vertices[i1].position) - v0;
        let delta_pos2 = Vec3::from_array(vertices[i2].position) - v0;
        let uv0 = Vec2::from_array(vertices[i0].uv);
        let delta_uv1 = Vec2::from_array(vertices[i1].uv) - uv0;
        let delta_uv2 = Vec2::from_array(vertices[i2].uv) - uv0;

        let denom = delta_uv1.x * delta_uv2.y - delta_uv1.y * delta_uv2.x;
        if denom.abs() < 1e-8 {
            continue;
        }
        let r = 1.0 / denom;
        let sdir = (delta_pos1 * delta_uv2.y - delta_pos2 * delta_uv1.y) * r;
        let tdir = (delta_pos2 * delta_uv1.x - delta_pos1 * delta_uv2.x) * r;
        for i in [i0, i1, i2] {
            tan1[i] += sdir;
            tan2[i] += tdir;
        }
    }

    for (i, vertex) in vertices.iter_mut().enumerate() {
        let normal = Vec3::from_array(vertex.normal);
        let t1 = tan1[i];
        if t1.length_squared() > 0.0 {
            let tangent = (t1 - normal * normal.dot(t1)).normalize_or_zero();
            let w = if normal.cross(t1).dot(tan2[i]) < 0.0 { -1.0 } else { 1.0 };
            vertex.tangent = [tangent.x, tangent.y, tangent.z, w];
        } else {
            vertex.tangent = [1.0, 0.0, 0.0, 1.0];
        }
    }
}

impl MeshBounds {
    pub fn from_vertices(vertices: &[MeshVertex]) -> Self {
        if vertices.is_empty() {
            return MeshBounds { min: Vec3::ZERO, max: Vec3::ZERO, center: Vec3::ZERO, radius: 0.0 };
        }
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for vertex in vertices {
            let pos = Vec3::from_array(vertex.position);
            min = min.min(pos);
            max = max.max(pos);
        }
        let center = (min + max) * 0.5;
        let radius = vertices
            .iter()
            .map(|vertex| (Vec3::from_array(vertex.position) - center).length())
            .fold(0.0f32, f32::max);
        MeshBounds { min, max, center, radius }
    }
}

/// Uploaded meshes addressed by the handles draw commands carry.
#[derive(Default)]
pub struct MeshRegistry {
    meshes: Vec<GpuMesh>,
}

impl MeshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, device: &wgpu::Device, mesh: &Mesh, label: &str) -> MeshHandle {
        let handle = MeshHandle(self.meshes.len() as u32);
        self.meshes.push(GpuMesh::upload(device, mesh, label));
        tracing::debug!(mesh = label, handle = handle.0, indices = mesh.indices.len(), "registered mesh");
        handle
    }

    pub fn get(&self, handle: MeshHandle) -> Option<&GpuMesh> {
        self.meshes.get(handle.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_struct() {
        assert_eq!(std::mem::size_of::<MeshVertex>(), 48);
        assert_eq!(MeshVertex::layout().array_stride, 48);
    }

    #[test]
    fn cube_has_outward_faces_and_tangents() {
        let mesh = Mesh::cube(2.0);
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.indices.len(), 36);
        assert_eq!(mesh.bounds.min, Vec3::splat(-1.0));
        for tri in mesh.indices.chunks_exact(3) {
            let a = Vec3::from_array(mesh.vertices[tri[0] as usize].position);
            let b = Vec3::from_array(mesh.vertices[tri[1] as usize].position);
            let c = Vec3::from_array(mesh.vertices[tri[2] as usize].position);
            let face_normal = (b - a).cross(c - a).normalize();
            let stored = Vec3::from_array(mesh.vertices[tri[0] as usize].normal);
            assert!(face_normal.dot(stored) > 0.99, "triangle {tri:?} winds inward");
        }
        for vertex in &mesh.vertices {
            let tangent = Vec3::new(vertex.tangent[0], vertex.tangent[1], vertex.tangent[2]);
            assert!((tangent.length() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn plane_winds_counter_clockwise_upward() {
        let mesh = Mesh::plane(10.0, 4);
        assert_eq!(mesh.vertices.len(), 25);
        assert_eq!(mesh.indices.len(), 96);
        let tri = &mesh.indices[0..3];
        let a = Vec3::from_array(mesh.vertices[tri[0] as usize].position);
        let b = Vec3::from_array(mesh.vertices[tri[1] as usize].position);
        let c = Vec3::from_array(mesh.vertices[tri[2] as usize].position);
        assert!((b - a).cross(c - a).y > 0.0);
        assert_eq!(mesh.bounds.max, Vec3::new(5.0, 0.0, 5.0));
    }

    #[test]
    fn sphere_normals_point_outward() {
        let mesh = Mesh::uv_sphere(1.5, 16, 8);
        for vertex in &mesh.vertices {
            let p = Vec3::from_array(vertex.position);
            let n = Vec3::from_array(vertex.normal);
            assert!((p.length() - 1.5).abs() < 1e-4);
            assert!((n.length() - 1.0).abs() < 1e-4);
        }
        assert!((mesh.bounds.radius - 1.5).abs() < 1e-3);
    }
}
